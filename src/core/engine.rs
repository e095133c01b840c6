//! Namespace-bound entry points
//!
//! Each call opens one connection, does its work, and closes the connection
//! before returning, on error paths included.

use crate::core::error::Result;
use crate::core::model::{DesiredZone, ObservedZone, ZoneName};
use crate::core::netns::{Connection, open_connection};
use crate::core::reader;
use crate::core::rule::Rule;
use crate::core::sync::{self, SyncOutcome};
use crate::core::templates::{IpFamily, RateLimit};
use crate::core::topology::{ChainName, Topology};
use tracing::warn;

/// The zone firewall of one network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firewall {
    /// `None` for the caller's own namespace
    pub netns: Option<String>,
    /// Family matched by the established-only protocol rule
    pub family: IpFamily,
    /// ICMP rate installed into Input by bootstrap
    pub icmp_limit: RateLimit,
}

impl Firewall {
    pub fn new(netns: Option<String>, family: IpFamily) -> Self {
        Self {
            netns,
            family,
            icmp_limit: RateLimit::default(),
        }
    }

    #[must_use]
    pub fn with_icmp_limit(mut self, limit: RateLimit) -> Self {
        self.icmp_limit = limit;
        self
    }

    fn topology(&self) -> Topology {
        Topology::standard().with_icmp_limit(self.icmp_limit)
    }

    fn connect(&self) -> Result<Connection> {
        match &self.netns {
            Some(name) => open_connection(&[name.as_str()]),
            None => open_connection(&[]),
        }
    }

    /// Runs `work` on a fresh connection and always closes it.
    fn with_connection<T>(&self, work: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.connect()?;
        let result = work(&mut conn);
        if let Err(e) = conn.close() {
            warn!("Closing connection to {:?}: {}", self.netns, e);
        }
        result
    }

    /// Deletes and recreates the table with the standard topology.
    ///
    /// # Errors
    ///
    /// Connection errors and the first rejected commit.
    pub fn bootstrap(&self) -> Result<usize> {
        self.with_connection(|conn| sync::bootstrap(conn, &self.topology(), self.family))
    }

    /// # Errors
    ///
    /// Connection and listing errors.
    pub fn read_zone(&self, zone: ZoneName) -> Result<ObservedZone> {
        self.with_connection(|conn| reader::read_zone(conn, zone))
    }

    /// # Errors
    ///
    /// Connection errors and the first listing error or rejected commit.
    pub fn sync_zone(&self, zone: ZoneName, desired: &DesiredZone) -> Result<SyncOutcome> {
        self.with_connection(|conn| sync::sync_zone(conn, zone, desired, self.family))
    }

    /// All rules of every chain, in topology order.
    ///
    /// # Errors
    ///
    /// Connection and listing errors.
    pub fn dump(&self) -> Result<Vec<(ChainName, Vec<Rule>)>> {
        self.with_connection(|conn| sync::dump_chains(conn, &self.topology()))
    }
}
