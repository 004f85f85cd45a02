//! Named endpoint registry.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::net::addr;
use crate::server::runner::{PacketRunner, StreamRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

#[derive(Clone)]
pub enum Runner {
    Stream(Arc<dyn StreamRunner>),
    Packet(Arc<dyn PacketRunner>),
}

impl Runner {
    pub fn transport(&self) -> Transport {
        match self {
            Runner::Stream(_) => Transport::Tcp,
            Runner::Packet(_) => Transport::Udp,
        }
    }

    pub async fn graceful_stop(&self) -> Result<()> {
        match self {
            Runner::Stream(runner) => runner.graceful_stop().await,
            Runner::Packet(runner) => runner.graceful_stop().await,
        }
    }
}

/// One registered endpoint. A `None` address means the endpoint is disabled:
/// it is never bound but is still stopped with the others.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    address: Option<SocketAddr>,
    runner: Runner,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("transport", &self.runner.transport())
            .field("address", &self.address)
            .finish()
    }
}

/// Endpoints in registration order. No two endpoints of one transport may
/// resolve to the same address.
#[derive(Default, Debug)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
}

impl Registry {
    pub fn register(&mut self, name: impl Into<String>, address: &str, runner: Runner) -> Result<()> {
        let name = name.into();
        let transport = runner.transport();
        let address = if address.is_empty() {
            None
        } else {
            Some(addr::resolve(address).map_err(|source| Error::InvalidAddress {
                address: address.to_string(),
                source,
            })?)
        };

        if let Some(resolved) = address {
            let existing = self.endpoints.iter().find(|endpoint| {
                endpoint.runner.transport() == transport && endpoint.address == Some(resolved)
            });
            if let Some(existing) = existing {
                return Err(Error::AddressInUse {
                    transport: transport.as_str(),
                    addr: resolved,
                    existing: existing.name.clone(),
                });
            }
        }

        tracing::debug!(
            endpoint = %name,
            transport = transport.as_str(),
            address = ?address,
            "Registered endpoint"
        );
        self.endpoints.push(Endpoint {
            name,
            address,
            runner,
        });
        Ok(())
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}
