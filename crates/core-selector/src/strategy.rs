//! Selection strategies: choosing one instance from a candidate set
//!
//! A strategy only ever sees candidates the registry has already filtered for
//! liveness and capability. Strategies order candidates by instance id before
//! choosing, so the result never depends on map iteration order.
//!
//! Two strategies ship with the crate:
//!
//! - [`RandomStrategy`]: uniform choice, reproducible with a fixed seed
//! - [`RoundRobinStrategy`]: rotating cursor per routing key
//!
//! # Example
//!
//! ```
//! use dpf_core_selector::model::{DataPlaneInstance, TransferRequest};
//! use dpf_core_selector::strategy::{RoundRobinStrategy, SelectionStrategy};
//!
//! let candidates = vec![DataPlaneInstance::new("a"), DataPlaneInstance::new("b")];
//! let request = TransferRequest::new("HttpData", "AmazonS3", "push");
//! let strategy = RoundRobinStrategy::new();
//!
//! assert_eq!(strategy.select(&candidates, &request).unwrap().id.as_str(), "a");
//! assert_eq!(strategy.select(&candidates, &request).unwrap().id.as_str(), "b");
//! assert_eq!(strategy.select(&candidates, &request).unwrap().id.as_str(), "a");
//! ```

use crate::error::{Result, SelectorError};
use crate::model::{DataPlaneInstance, SelectionKey, TransferRequest};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name of the built-in random strategy
pub const RANDOM: &str = "random";

/// Name of the built-in round-robin strategy
pub const ROUND_ROBIN: &str = "round-robin";

/// Chooses one instance out of a non-empty candidate set
pub trait SelectionStrategy: Send + Sync {
    /// Name under which the strategy is registered
    fn name(&self) -> &str;

    /// Choose an instance.
    ///
    /// # Errors
    ///
    /// `NoEligibleInstance` when `candidates` is empty.
    fn select(
        &self,
        candidates: &[DataPlaneInstance],
        request: &TransferRequest,
    ) -> Result<DataPlaneInstance>;

    /// Drop per-route state for routes `keep` rejects. Returns how many
    /// routes were dropped. Stateless strategies keep the default.
    fn retain_routes(&self, _keep: &dyn Fn(&SelectionKey) -> bool) -> usize {
        0
    }
}

fn ordered(candidates: &[DataPlaneInstance]) -> Vec<&DataPlaneInstance> {
    let mut ordered: Vec<&DataPlaneInstance> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    ordered
}

/// Uniform random choice.
///
/// The generator is owned by the strategy; two strategies built with the same
/// seed produce the same sequence of choices for the same inputs.
#[derive(Debug)]
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    /// Seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic generator
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &str {
        RANDOM
    }

    fn select(
        &self,
        candidates: &[DataPlaneInstance],
        request: &TransferRequest,
    ) -> Result<DataPlaneInstance> {
        if candidates.is_empty() {
            return Err(SelectorError::no_eligible_instance(request));
        }

        let ordered = ordered(candidates);
        let index = self.rng.lock().random_range(0..ordered.len());
        Ok(ordered[index].clone())
    }
}

/// Rotating choice per routing key.
///
/// The cursor of a key is the position of the next pick in the candidate list
/// ordered by id. When the candidate set changes between calls the cursor is
/// simply reinterpreted modulo the new length.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursors: Mutex<HashMap<SelectionKey, usize>>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor of a routing key, if it has been used
    pub fn cursor(&self, key: &SelectionKey) -> Option<usize> {
        self.cursors.lock().get(key).copied()
    }

    /// Forget every cursor
    pub fn reset(&self) {
        self.cursors.lock().clear();
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn select(
        &self,
        candidates: &[DataPlaneInstance],
        request: &TransferRequest,
    ) -> Result<DataPlaneInstance> {
        if candidates.is_empty() {
            return Err(SelectorError::no_eligible_instance(request));
        }

        let ordered = ordered(candidates);
        let key = request.key();

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(key).or_insert(0);
        let index = *cursor % ordered.len();
        *cursor = (index + 1) % ordered.len();

        debug!(index, candidates = ordered.len(), "Round-robin pick");
        Ok(ordered[index].clone())
    }

    fn retain_routes(&self, keep: &dyn Fn(&SelectionKey) -> bool) -> usize {
        let mut cursors = self.cursors.lock();
        let before = cursors.len();
        cursors.retain(|key, _| keep(key));
        before - cursors.len()
    }
}

/// Named selection strategies with a default.
///
/// Built once when the runtime starts; requests may name a strategy to use
/// instead of the default.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn SelectionStrategy>>,
    default: String,
}

impl StrategyRegistry {
    /// Registry containing a single strategy, which is also the default
    pub fn new(default: Arc<dyn SelectionStrategy>) -> Self {
        let name = default.name().to_string();
        let mut strategies = HashMap::new();
        strategies.insert(name.clone(), default);
        Self {
            strategies,
            default: name,
        }
    }

    /// Registry with the built-in strategies.
    ///
    /// `seed` makes the random strategy deterministic.
    ///
    /// # Errors
    ///
    /// `UnknownStrategy` if `default` is not a built-in name.
    pub fn with_builtin(default: &str, seed: Option<u64>) -> Result<Self> {
        let random = match seed {
            Some(seed) => RandomStrategy::with_seed(seed),
            None => RandomStrategy::new(),
        };

        let mut registry = Self::new(Arc::new(random));
        registry.register(Arc::new(RoundRobinStrategy::new()));
        registry.set_default(default)?;
        Ok(registry)
    }

    /// Add or replace a strategy under its own name
    pub fn register(&mut self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    /// Change the default strategy
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.strategies.contains_key(name) {
            return Err(SelectorError::UnknownStrategy(name.to_string()));
        }
        self.default = name.to_string();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SelectionStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| SelectorError::UnknownStrategy(name.to_string()))
    }

    /// The strategy named by the request, or the default
    pub fn resolve(&self, request: &TransferRequest) -> Result<Arc<dyn SelectionStrategy>> {
        self.get(request.strategy.as_deref().unwrap_or(&self.default))
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Drop per-route state of every strategy for routes `keep` rejects
    pub fn retain_routes(&self, keep: &dyn Fn(&SelectionKey) -> bool) -> usize {
        self.strategies
            .values()
            .map(|strategy| strategy.retain_routes(keep))
            .sum()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
