//! Token buckets and their assignment to principals

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::auth::{GroupConfig, Principal, UserConfig, ANONYMOUS_USER};
use crate::config::duration_format;

/// Call allowance: `calls` tokens added every `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Quota {
    pub calls: u64,
    #[serde(deserialize_with = "duration_format::deserialize")]
    pub period: Duration,
    /// Tokens available at creation, defaults to `calls`
    #[serde(default)]
    pub initial_available_calls: Option<u64>,
    /// Bucket capacity, defaults to `calls`
    #[serde(default)]
    pub max_available_calls: Option<u64>,
}

impl Quota {
    pub fn new(calls: u64, period: Duration) -> Self {
        Self {
            calls,
            period,
            initial_available_calls: None,
            max_available_calls: None,
        }
    }

    pub fn initial(&self) -> u64 {
        self.initial_available_calls.unwrap_or(self.calls)
    }

    pub fn capacity(&self) -> u64 {
        self.max_available_calls.unwrap_or(self.calls).max(1)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket refilled in whole periods
#[derive(Debug)]
pub struct Bucket {
    quota: Quota,
    state: Mutex<BucketState>,
}

impl Bucket {
    pub fn new(quota: Quota) -> Self {
        Self::starting_at(quota, Instant::now())
    }

    fn starting_at(quota: Quota, now: Instant) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: quota.initial().min(quota.capacity()),
                last_refill: now,
            }),
            quota,
        }
    }

    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Take `tokens`; on shortage nothing is taken and the wait is returned
    pub fn try_consume(&self, tokens: u64) -> Option<Duration> {
        self.try_consume_at(tokens, Instant::now())
    }

    fn try_consume_at(&self, tokens: u64, now: Instant) -> Option<Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.tokens >= tokens {
            state.tokens -= tokens;
            return None;
        }
        if self.quota.calls == 0 || self.quota.period.is_zero() {
            return Some(Duration::MAX);
        }
        let missing = tokens - state.tokens;
        let periods = missing.div_ceil(self.quota.calls);
        let ready_at = state.last_refill + self.quota.period.saturating_mul(periods as u32);
        Some(ready_at.saturating_duration_since(now))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.quota.calls == 0 || self.quota.period.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let periods = (elapsed.as_nanos() / self.quota.period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(self.quota.calls);
        state.tokens = state.tokens.saturating_add(added).min(self.quota.capacity());
        state.last_refill += self.quota.period.saturating_mul(periods.min(u32::MAX as u64) as u32);
    }
}

/// Builds and hands out the buckets that apply to a request
pub struct BucketManager {
    by_user: HashMap<String, Vec<Arc<Bucket>>>,
    by_group: HashMap<String, Arc<Bucket>>,
    by_address: DashMap<IpAddr, Vec<Arc<Bucket>>>,
    anonymous_quotas: Vec<Quota>,
}

impl BucketManager {
    pub fn new(users: &[UserConfig], groups: &[GroupConfig]) -> Self {
        let groups_by_name: HashMap<&str, &GroupConfig> =
            groups.iter().map(|group| (group.name.as_str(), group)).collect();

        let quotas_of = |user: &UserConfig| -> Vec<Quota> {
            match user.quota {
                Some(quota) => vec![quota],
                None => user
                    .groups
                    .iter()
                    .filter_map(|name| groups_by_name.get(name.as_str()))
                    .filter_map(|group| group.user_quota)
                    .collect(),
            }
        };

        let mut by_user = HashMap::new();
        let mut anonymous_quotas = Vec::new();
        for user in users {
            let quotas = quotas_of(user);
            if user.name == ANONYMOUS_USER {
                anonymous_quotas = quotas;
            } else if !quotas.is_empty() {
                let buckets = quotas.into_iter().map(|q| Arc::new(Bucket::new(q))).collect();
                by_user.insert(user.name.clone(), buckets);
            }
        }

        let by_group = groups
            .iter()
            .filter_map(|group| {
                group
                    .group_quota
                    .map(|quota| (group.name.clone(), Arc::new(Bucket::new(quota))))
            })
            .collect();

        Self {
            by_user,
            by_group,
            by_address: DashMap::new(),
            anonymous_quotas,
        }
    }

    /// True when no bucket could ever apply
    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty() && self.by_group.is_empty() && self.anonymous_quotas.is_empty()
    }

    /// Buckets charged for one request
    pub fn buckets_for(&self, principal: &Principal, address: IpAddr) -> Vec<Arc<Bucket>> {
        let mut buckets = Vec::new();
        if principal.is_anonymous() {
            if !self.anonymous_quotas.is_empty() {
                let entry = self.by_address.entry(address).or_insert_with(|| {
                    self.anonymous_quotas
                        .iter()
                        .map(|quota| Arc::new(Bucket::new(*quota)))
                        .collect()
                });
                buckets.extend(entry.value().iter().cloned());
            }
        } else if let Some(user_buckets) = principal.user.as_ref().and_then(|u| self.by_user.get(u)) {
            buckets.extend(user_buckets.iter().cloned());
        }
        for group in &principal.groups {
            if let Some(bucket) = self.by_group.get(group) {
                buckets.push(Arc::clone(bucket));
            }
        }
        buckets
    }
}

// =============================================================================
// Tests
// =============================================================================
