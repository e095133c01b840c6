//! Reconcile pass for one firewall instance
//!
//! One pass converges every zone of a spec and mirrors what the kernel
//! reports back into the status. The caller decides when to run the next
//! pass from [`ReconcileResult`].

use crate::core::backend::RulesetBackend;
use crate::core::engine::Firewall;
use crate::core::error::{Error, Result};
use crate::core::model::{
    DesiredZone, FirewallSpec, FirewallStatus, PrefixCatalog, ZoneName, ZoneSpec, ZoneStatus,
};
use crate::core::sync::{self, SyncOutcome};
use crate::core::templates::IpFamily;
use crate::validators::validate_cidr;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Applies desired zone state somewhere and reports what ended up there.
pub trait ZoneDriver {
    /// # Errors
    ///
    /// Connection errors and the first listing or commit error.
    fn sync_zone(&mut self, zone: ZoneName, desired: &DesiredZone) -> Result<SyncOutcome>;
}

impl ZoneDriver for Firewall {
    fn sync_zone(&mut self, zone: ZoneName, desired: &DesiredZone) -> Result<SyncOutcome> {
        Firewall::sync_zone(self, zone, desired)
    }
}

/// Drives any ruleset backend directly; used for dry runs and tests.
#[derive(Debug)]
pub struct BackendDriver<B> {
    pub backend: B,
    pub family: IpFamily,
}

impl<B: RulesetBackend> BackendDriver<B> {
    pub fn new(backend: B, family: IpFamily) -> Self {
        Self { backend, family }
    }
}

impl<B: RulesetBackend> ZoneDriver for BackendDriver<B> {
    fn sync_zone(&mut self, zone: ZoneName, desired: &DesiredZone) -> Result<SyncOutcome> {
        sync::sync_zone(&mut self.backend, zone, desired, self.family)
    }
}

/// Resolves allow-list names to CIDRs.
pub trait PrefixResolver {
    fn resolve(&self, name: &str) -> Option<Vec<String>>;
}

impl PrefixResolver for PrefixCatalog {
    fn resolve(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(<[String]>::to_vec)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Status changed and should be persisted
    pub status_updated: bool,
    /// Run again right away
    pub requeue: bool,
    /// Run again after this delay
    pub requeue_after: Option<Duration>,
}

pub struct Reconciler<'a, D, R> {
    region: &'a str,
    driver: D,
    resolver: &'a R,
    retry_after: Duration,
    outcomes: Vec<(ZoneName, SyncOutcome)>,
}

impl<'a, D: ZoneDriver, R: PrefixResolver> Reconciler<'a, D, R> {
    pub fn new(region: &'a str, driver: D, resolver: &'a R, retry_after: Duration) -> Self {
        Self {
            region,
            driver,
            resolver,
            retry_after,
            outcomes: Vec::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Sync outcomes of every zone synced since the last call.
    pub fn take_outcomes(&mut self) -> Vec<(ZoneName, SyncOutcome)> {
        std::mem::take(&mut self.outcomes)
    }

    /// Resolves prefix names (case-insensitively) to the union of their
    /// CIDRs. Unknown names are left out and returned separately.
    fn resolve_prefixes(&self, names: &[String]) -> (BTreeSet<String>, BTreeSet<String>, Vec<String>) {
        let mut resolved = BTreeSet::new();
        let mut addresses = BTreeSet::new();
        let mut missing = Vec::new();
        for name in names {
            let lower = name.to_lowercase();
            match self.resolver.resolve(&lower) {
                Some(cidrs) => {
                    addresses.extend(cidrs);
                    resolved.insert(lower);
                }
                None => missing.push(lower),
            }
        }
        (resolved, addresses, missing)
    }

    /// Runs one pass.
    ///
    /// Zones in the spec without status get their status initialized and the
    /// pass ends there with `requeue`. Otherwise every zone is synced and its
    /// status replaced by the re-read kernel state.
    ///
    /// # Errors
    ///
    /// The first zone sync error. Zones synced before it keep their kernel
    /// changes; `status` is left untouched for the failing zone.
    pub fn reconcile(
        &mut self,
        spec: &FirewallSpec,
        status: &mut FirewallStatus,
    ) -> Result<ReconcileResult> {
        let span = info_span!("reconcile", region = %self.region, pass = %Uuid::new_v4());
        let _enter = span.enter();

        let mut result = ReconcileResult::default();

        let missing: Vec<ZoneName> = spec
            .zones
            .keys()
            .filter(|z| !status.zones.contains_key(z))
            .copied()
            .collect();
        if !missing.is_empty() {
            for zone in missing {
                debug!("{}", Error::InconsistentSpecStatus(zone.to_string()));
                info!("Initializing status for zone {}", zone);
                status
                    .zones
                    .insert(zone, ZoneStatus::from_spec(&spec.zones[&zone]));
            }
            status.updated_at = Some(chrono::Utc::now());
            result.status_updated = true;
            result.requeue = true;
            return Ok(result);
        }

        for zone in status.zones.keys() {
            if !spec.zones.contains_key(zone) {
                warn!("Zone {} has status but no spec, leaving it alone", zone);
            }
        }

        for (zone, zone_spec) in &spec.zones {
            let zone_result = self.reconcile_zone(*zone, zone_spec, status)?;
            result.status_updated |= zone_result.status_updated;
            if zone_result.requeue_after.is_some() {
                result.requeue_after = zone_result.requeue_after;
            }
        }

        if result.status_updated {
            status.updated_at = Some(chrono::Utc::now());
        }
        Ok(result)
    }

    fn reconcile_zone(
        &mut self,
        zone: ZoneName,
        spec: &ZoneSpec,
        status: &mut FirewallStatus,
    ) -> Result<ReconcileResult> {
        let (resolved, addresses, unknown) = self.resolve_prefixes(&spec.allow_prefix_names);
        for name in &unknown {
            warn!("Zone {}: prefix list {:?} not found", zone, name);
        }

        let desired = DesiredZone::new(spec.interfaces.iter().cloned(), spec.zone_policy, addresses);
        let outcome = self.driver.sync_zone(zone, &desired)?;

        for rejected in &outcome.rejected {
            warn!(
                "Zone {}: ignored {:?}: {}",
                zone, rejected.value, rejected.reason
            );
        }

        let rejected: BTreeSet<&str> = outcome.rejected.iter().map(|r| r.value.as_str()).collect();
        let wanted_interfaces: BTreeSet<String> = desired
            .interfaces
            .iter()
            .filter(|i| !rejected.contains(i.as_str()))
            .cloned()
            .collect();
        let wanted_addresses: BTreeSet<String> = desired
            .addresses
            .iter()
            .filter(|a| !rejected.contains(a.as_str()))
            .filter_map(|a| validate_cidr(a).ok())
            .collect();

        let observed = &outcome.observed;
        let converged = observed.interfaces == wanted_interfaces
            && observed.policy == Some(spec.zone_policy)
            && observed.addresses == wanted_addresses;

        let previous = status.zones.get(&zone);
        let allow_prefix_names = if observed.addresses == wanted_addresses {
            resolved.into_iter().collect()
        } else {
            previous
                .map(|s| s.allow_prefix_names.clone())
                .unwrap_or_default()
        };
        let next = ZoneStatus {
            interfaces: observed.interfaces.iter().cloned().collect(),
            zone_policy: observed.policy,
            allow_prefix_names,
            created: true,
        };

        let mut result = ReconcileResult::default();
        if previous != Some(&next) {
            info!(
                "Zone {} status: interfaces {:?}, policy {:?}, prefixes {:?}",
                zone, next.interfaces, next.zone_policy, next.allow_prefix_names
            );
            status.zones.insert(zone, next);
            result.status_updated = true;
        }
        if !converged {
            warn!("Zone {} did not converge, retrying in {:?}", zone, self.retry_after);
            result.requeue_after = Some(self.retry_after);
        }
        self.outcomes.push((zone, outcome));
        Ok(result)
    }
}
