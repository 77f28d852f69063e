//! Identity of the running process as seen by the rest of the fleet

use discovery_api::{Endpoint, HealthCheckDescriptor, InstanceRecord, ServiceName, ValidationError};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::debug;

/// Name, address and port this process is reachable at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub service: ServiceName,
    pub address: String,
    pub port: u16,
}

impl InstanceIdentity {
    pub fn new(service: ServiceName, address: impl Into<String>, port: u16) -> Result<Self, ValidationError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ValidationError::Address(address));
        }
        if port == 0 {
            return Err(ValidationError::Port(port));
        }
        Ok(Self { service, address, port })
    }

    /// Derive the identity, preferring an explicitly advertised address over
    /// the address of the interface that routes outbound traffic.
    pub fn detect(
        service: ServiceName,
        port: u16,
        advertise_address: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let address = match advertise_address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => address.to_string(),
            None => outbound_address().to_string(),
        };
        debug!(service = %service, "Detected instance address {}:{}", address, port);
        Self::new(service, address, port)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    /// Build a registration record with a freshly minted instance id
    pub fn record(&self, health_check: HealthCheckDescriptor) -> InstanceRecord {
        InstanceRecord::new(self.service.clone(), self.address.clone(), self.port, health_check)
    }
}

/// Local address of the default route, falling back to loopback.
/// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_address() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
