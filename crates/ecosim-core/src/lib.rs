//! Core simulation engine for the ecosim workspace.
//!
//! The [`Environment`] owns every entity and advances the world through a
//! fixed tick pipeline: perceive and decide against a frozen snapshot, move,
//! interact under atomic claims, merge reproduction, age, then rebuild the
//! spatial index. Strategy callbacks are contained per organism, so one
//! misbehaving closure degrades to a no-op rather than poisoning the tick.

use ecosim_index::{IndexError, NaiveIndex, SpatialIndex, UniformGridIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for entities backed by a generational slot map.
    pub struct EntityId;
}

/// Number of genes carried by every genome.
pub const GENE_COUNT: usize = 4;
/// Life-span assigned to a freshly constructed organism.
pub const DEFAULT_LIFE_SPAN: f32 = 500.0;
/// Energy carried by food built with `Food::default`.
pub const DEFAULT_FOOD_ENERGY: f32 = 100.0;

const TRAIT_SCALE: f32 = 4.0;
const POSITION_EPSILON: f32 = 1e-4;

/// Errors surfaced by the environment.
#[derive(Debug, Error)]
pub enum EcosimError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Indicates a placement outside the world rectangle.
    #[error("position ({x}, {y}) lies outside the {width}x{height} world")]
    OutOfBounds {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    /// The referenced entity is not resident (wrong kind, removed, or foreign).
    #[error("entity is not resident in this environment")]
    UnknownEntity,
    /// The worker pool could not be constructed.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
    /// A worker panicked outside any contained strategy call.
    #[error("worker panicked during a parallel phase: {0}")]
    Concurrency(String),
    /// Propagated spatial index failure.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Monotonic simulation tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// 2D position in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Derived phenotype decoded from a genome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Traits {
    /// Distance covered per tick when moving.
    pub speed: f32,
    /// Body size; doubles as the interaction reach.
    pub size: f32,
    /// Sensing bonus added to size for the perception radius.
    pub awareness: f32,
}

/// Fixed-width gene array. Genes map to traits by a quarter scale, so each
/// derived trait lives in `[0, 63.75]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genome {
    genes: [u8; GENE_COUNT],
}

impl Default for Genome {
    fn default() -> Self {
        Self {
            genes: [20; GENE_COUNT],
        }
    }
}

impl Genome {
    #[must_use]
    pub const fn new(genes: [u8; GENE_COUNT]) -> Self {
        Self { genes }
    }

    /// Sample a uniformly random genome from `rng`.
    #[must_use]
    pub fn random(rng: &mut SmallRng) -> Self {
        Self { genes: rng.gen() }
    }

    #[must_use]
    pub const fn genes(&self) -> &[u8; GENE_COUNT] {
        &self.genes
    }

    /// Decode the genome into derived traits.
    #[must_use]
    pub fn decode(&self) -> Traits {
        Traits {
            speed: f32::from(self.genes[0]) / TRAIT_SCALE,
            size: f32::from(self.genes[1]) / TRAIT_SCALE,
            awareness: f32::from(self.genes[2]) / TRAIT_SCALE,
        }
    }

    /// Return a perturbed copy. Each gene independently mutates with
    /// probability `rate`, shifting by a signed offset up to `magnitude` and
    /// saturating at the byte bounds. The source genome is left untouched.
    #[must_use]
    pub fn mutate(&self, rate: f32, magnitude: u8, rng: &mut SmallRng) -> Self {
        let span = i16::from(magnitude);
        let mut genes = self.genes;
        for gene in &mut genes {
            if rng.gen::<f32>() < rate {
                let offset = rng.gen_range(-span..=span);
                *gene = (i16::from(*gene) + offset).clamp(0, 255) as u8;
            }
        }
        Self { genes }
    }
}

/// An energy pellet organisms can consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Food {
    energy: f32,
    edible: bool,
}

impl Default for Food {
    fn default() -> Self {
        Self::new(DEFAULT_FOOD_ENERGY)
    }
}

impl Food {
    #[must_use]
    pub const fn new(energy: f32) -> Self {
        Self {
            energy,
            edible: true,
        }
    }

    #[must_use]
    pub const fn energy(&self) -> f32 {
        self.energy
    }

    #[must_use]
    pub const fn can_be_eaten(&self) -> bool {
        self.edible
    }

    /// Consume the food, returning its energy. Repeat calls are no-ops that
    /// yield zero, which is what a losing claim racer observes.
    pub fn eaten(&mut self) -> f32 {
        if !self.edible {
            return 0.0;
        }
        self.edible = false;
        self.energy
    }
}

/// Read-only view of the acting organism handed to strategy callbacks.
#[derive(Debug, Clone, Copy)]
pub struct OrganismView {
    pub id: EntityId,
    pub position: Position,
    pub speed: f32,
    pub size: f32,
    pub awareness: f32,
    pub life_span: f32,
}

/// Kind-specific payload attached to each perceived neighbor.
#[derive(Debug, Clone, Copy)]
pub enum NeighborDetail {
    Organism {
        size: f32,
        speed: f32,
        life_span: f32,
        alive: bool,
    },
    Food {
        energy: f32,
        edible: bool,
    },
}

impl NeighborDetail {
    #[must_use]
    pub fn is_edible_food(&self) -> bool {
        matches!(self, Self::Food { edible: true, .. })
    }

    #[must_use]
    pub fn is_live_organism(&self) -> bool {
        matches!(self, Self::Organism { alive: true, .. })
    }
}

/// One entry of the neighbor list passed to strategies. Lists arrive sorted
/// by distance (ties broken by assignment order), so the first match of any
/// predicate is also the nearest.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub id: EntityId,
    pub position: Position,
    pub distance: f32,
    pub detail: NeighborDetail,
}

/// Desired displacement produced by a reaction strategy. Only the direction
/// matters; the environment rescales it to the organism's speed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoveIntent {
    pub dx: f32,
    pub dy: f32,
}

impl MoveIntent {
    /// Intent to remain in place.
    #[must_use]
    pub const fn stay() -> Self {
        Self { dx: 0.0, dy: 0.0 }
    }

    #[must_use]
    pub fn toward(from: Position, to: Position) -> Self {
        Self {
            dx: to.x - from.x,
            dy: to.y - from.y,
        }
    }

    #[must_use]
    pub fn away_from(from: Position, threat: Position) -> Self {
        Self {
            dx: from.x - threat.x,
            dy: from.y - threat.y,
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.dx.is_finite() && self.dy.is_finite()
    }
}

/// Effect requested by an interaction strategy against one neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionCommand {
    /// Eat the referenced food entity.
    Consume(EntityId),
    /// Kill the referenced organism, absorbing its remaining life-span.
    Attack(EntityId),
}

/// Movement decision made from the acting organism's view and its neighbors.
pub type ReactionFn = dyn Fn(&OrganismView, &[Neighbor]) -> MoveIntent + Send + Sync;
/// Contact effects requested against neighbors within interaction reach.
pub type InteractionFn = dyn Fn(&OrganismView, &[Neighbor]) -> Vec<InteractionCommand> + Send + Sync;
/// Per-tick life-span upkeep charged to the organism.
pub type LifeCostFn = dyn Fn(&OrganismView) -> f32 + Send + Sync;

#[derive(Clone, Default)]
struct BehaviorSet {
    reaction: Option<Arc<ReactionFn>>,
    interaction: Option<Arc<InteractionFn>>,
    life_cost: Option<Arc<LifeCostFn>>,
}

impl fmt::Debug for BehaviorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorSet")
            .field("reaction", &self.reaction.is_some())
            .field("interaction", &self.interaction.is_some())
            .field("life_cost", &self.life_cost.is_some())
            .finish()
    }
}

/// Built-in strategy constructors.
///
/// Each returns a shareable callback suitable for the `Organism::with_*`
/// builders; the closures capture only their tuning parameters.
pub mod strategies {
    use super::{
        InteractionCommand, InteractionFn, LifeCostFn, MoveIntent, NeighborDetail, ReactionFn,
    };
    use std::sync::Arc;

    /// Head for the nearest edible food in range, stand still otherwise.
    #[must_use]
    pub fn nearest_food() -> Arc<ReactionFn> {
        Arc::new(|view, neighbors| {
            neighbors
                .iter()
                .find(|n| n.detail.is_edible_food())
                .map_or(MoveIntent::stay(), |food| {
                    MoveIntent::toward(view.position, food.position)
                })
        })
    }

    /// Consume every edible food within reach.
    #[must_use]
    pub fn graze() -> Arc<InteractionFn> {
        Arc::new(|_view, neighbors| {
            neighbors
                .iter()
                .filter(|n| n.detail.is_edible_food())
                .map(|n| InteractionCommand::Consume(n.id))
                .collect()
        })
    }

    /// Run from the nearest organism larger than `ratio` times the subject's
    /// size; forage for food when no threat is visible.
    #[must_use]
    pub fn flee_then_eat(ratio: f32) -> Arc<ReactionFn> {
        Arc::new(move |view, neighbors| {
            let threat = neighbors.iter().find(|n| match n.detail {
                NeighborDetail::Organism {
                    size, alive: true, ..
                } => size > view.size * ratio,
                _ => false,
            });
            if let Some(threat) = threat {
                return MoveIntent::away_from(view.position, threat.position);
            }
            neighbors
                .iter()
                .find(|n| n.detail.is_edible_food())
                .map_or(MoveIntent::stay(), |food| {
                    MoveIntent::toward(view.position, food.position)
                })
        })
    }

    /// Pursue the nearest organism smaller than the subject by more than
    /// `ratio`; stand still when nothing qualifies.
    #[must_use]
    pub fn chase_prey(ratio: f32) -> Arc<ReactionFn> {
        Arc::new(move |view, neighbors| {
            neighbors
                .iter()
                .find(|n| match n.detail {
                    NeighborDetail::Organism {
                        size, alive: true, ..
                    } => view.size > size * ratio,
                    _ => false,
                })
                .map_or(MoveIntent::stay(), |prey| {
                    MoveIntent::toward(view.position, prey.position)
                })
        })
    }

    /// Eat whatever food is in reach and attack organisms smaller than the
    /// subject by more than `ratio`, absorbing their remaining life-span.
    #[must_use]
    pub fn predation(ratio: f32) -> Arc<InteractionFn> {
        Arc::new(move |view, neighbors| {
            neighbors
                .iter()
                .filter_map(|n| match n.detail {
                    NeighborDetail::Food { edible: true, .. } => {
                        Some(InteractionCommand::Consume(n.id))
                    }
                    NeighborDetail::Organism {
                        size, alive: true, ..
                    } if view.size > size * ratio => Some(InteractionCommand::Attack(n.id)),
                    _ => None,
                })
                .collect()
        })
    }

    /// Constant per-tick decay, independent of traits.
    #[must_use]
    pub fn fixed_decay(amount: f32) -> Arc<LifeCostFn> {
        Arc::new(move |_view| amount)
    }

    /// Trait-driven upkeep: faster, bigger, more aware organisms pay more.
    #[must_use]
    pub fn metabolic() -> Arc<LifeCostFn> {
        Arc::new(|view| {
            let speed = view.speed / 10.0;
            let size = view.size / 10.0;
            let awareness = view.awareness / 10.0;
            (speed * speed + size * size * (view.size / 15.0) + awareness) * 1.3
        })
    }
}

/// A living agent with a genome, cached derived traits, and optional
/// per-organism behavior overrides.
#[derive(Debug, Clone)]
pub struct Organism {
    genome: Genome,
    traits: Traits,
    life_span: f32,
    alive: bool,
    behaviors: BehaviorSet,
}

impl Organism {
    #[must_use]
    pub fn new(genome: Genome) -> Self {
        Self {
            genome,
            traits: genome.decode(),
            life_span: DEFAULT_LIFE_SPAN,
            alive: true,
            behaviors: BehaviorSet::default(),
        }
    }

    #[must_use]
    pub fn with_life_span(mut self, life_span: f32) -> Self {
        self.life_span = life_span;
        self
    }

    #[must_use]
    pub fn with_reaction(mut self, strategy: Arc<ReactionFn>) -> Self {
        self.behaviors.reaction = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_interaction(mut self, strategy: Arc<InteractionFn>) -> Self {
        self.behaviors.interaction = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_life_cost(mut self, strategy: Arc<LifeCostFn>) -> Self {
        self.behaviors.life_cost = Some(strategy);
        self
    }

    #[must_use]
    pub const fn genome(&self) -> Genome {
        self.genome
    }

    #[must_use]
    pub const fn traits(&self) -> Traits {
        self.traits
    }

    #[must_use]
    pub const fn life_span(&self) -> f32 {
        self.life_span
    }

    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Radius within which the organism perceives neighbors.
    #[must_use]
    pub fn reaction_radius(&self) -> f32 {
        self.traits.size + self.traits.awareness
    }

    /// Radius within which the organism can touch neighbors.
    #[must_use]
    pub fn interaction_radius(&self) -> f32 {
        self.traits.size
    }

    #[must_use]
    pub fn can_reproduce(&self, threshold: f32) -> bool {
        self.alive && self.life_span > threshold
    }

    /// Split off a child. The parent's life-span halves; the child carries a
    /// mutated genome and inherits the parent's behavior set.
    pub fn reproduce(&mut self, rate: f32, magnitude: u8, rng: &mut SmallRng) -> Self {
        self.life_span *= 0.5;
        let mut child = Self::new(self.genome.mutate(rate, magnitude, rng));
        child.behaviors = self.behaviors.clone();
        child
    }
}

/// Payload stored per resident entity.
#[derive(Debug, Clone)]
pub enum EntityKind {
    Organism(Organism),
    Food(Food),
}

/// Position plus payload for one resident entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub position: Position,
    pub kind: EntityKind,
}

/// Entity storage: stable slot map handles over dense, cache-friendly
/// records. Dense indices shift on removal; handles never do.
#[derive(Debug, Default)]
pub struct EntityArena {
    slots: SlotMap<EntityId, usize>,
    handles: Vec<EntityId>,
    records: Vec<EntityRecord>,
}

impl EntityArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn insert(&mut self, record: EntityRecord) -> EntityId {
        let index = self.records.len();
        let id = self.slots.insert(index);
        self.handles.push(id);
        self.records.push(record);
        id
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    #[must_use]
    pub fn index_of(&self, id: EntityId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(*self.slots.get(id)?)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        let index = *self.slots.get(id)?;
        self.records.get_mut(index)
    }

    /// Handles aligned with `records`: `handles()[i]` owns `records()[i]`.
    #[must_use]
    pub fn handles(&self) -> &[EntityId] {
        &self.handles
    }

    #[must_use]
    pub fn records(&self) -> &[EntityRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [EntityRecord] {
        &mut self.records
    }

    /// Remove one entity, back-filling its dense slot from the tail.
    pub fn remove(&mut self, id: EntityId) -> Option<EntityRecord> {
        let index = self.slots.remove(id)?;
        let record = self.records.swap_remove(index);
        self.handles.swap_remove(index);
        if index < self.records.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(record)
    }

    /// Remove a batch in one compaction sweep, preserving the relative order
    /// of the survivors.
    pub fn remove_many(&mut self, ids: &HashSet<EntityId>) {
        if ids.is_empty() {
            return;
        }
        let mut write = 0;
        for read in 0..self.records.len() {
            let id = self.handles[read];
            if ids.contains(&id) {
                self.slots.remove(id);
                continue;
            }
            if write != read {
                self.records.swap(read, write);
                self.handles.swap(read, write);
            }
            if let Some(slot) = self.slots.get_mut(id) {
                *slot = write;
            }
            write += 1;
        }
        self.records.truncate(write);
        self.handles.truncate(write);
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.records.clear();
    }
}

/// Which spatial index implementation backs range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpatialStrategy {
    /// Linear scan over every entity.
    #[default]
    Naive,
    /// Uniform grid partition bucketed by cell.
    Partitioned,
}

/// Static configuration for an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// World width in world units; positions live in `[0, width)`.
    pub width: f32,
    /// World height in world units; positions live in `[0, height)`.
    pub height: f32,
    /// Spatial index strategy.
    pub spatial_strategy: SpatialStrategy,
    /// Worker threads for the parallel phases; 0 picks the rayon default.
    pub worker_count: usize,
    /// Cell edge length used by the partitioned index.
    pub grid_cell_size: f32,
    /// Per-gene probability of perturbation during reproduction.
    pub mutation_rate: f32,
    /// Largest absolute per-gene offset applied on mutation.
    pub mutation_magnitude: u8,
    /// Life-span drained per tick when no life-cost callback is installed.
    pub base_life_decay: f32,
    /// Life-span an organism must exceed before it splits.
    pub reproduction_threshold: f32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            width: 1_000.0,
            height: 1_000.0,
            spatial_strategy: SpatialStrategy::Naive,
            worker_count: 0,
            grid_cell_size: 50.0,
            mutation_rate: 0.25,
            mutation_magnitude: 16,
            base_life_decay: 1.0,
            reproduction_threshold: 1_000.0,
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl EnvironmentConfig {
    fn validate(&self) -> Result<(), EcosimError> {
        if !self.width.is_finite()
            || self.width <= 0.0
            || !self.height.is_finite()
            || self.height <= 0.0
        {
            return Err(EcosimError::InvalidConfig(
                "world dimensions must be positive and finite",
            ));
        }
        if !self.grid_cell_size.is_finite() || self.grid_cell_size <= 0.0 {
            return Err(EcosimError::InvalidConfig(
                "grid_cell_size must be positive",
            ));
        }
        if !self.mutation_rate.is_finite() || !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(EcosimError::InvalidConfig(
                "mutation_rate must lie in [0, 1]",
            ));
        }
        if !self.base_life_decay.is_finite() || self.base_life_decay < 0.0 {
            return Err(EcosimError::InvalidConfig(
                "base_life_decay must be non-negative",
            ));
        }
        if !self.reproduction_threshold.is_finite() || self.reproduction_threshold <= 0.0 {
            return Err(EcosimError::InvalidConfig(
                "reproduction_threshold must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(EcosimError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }

    fn build_index(&self) -> Box<dyn SpatialIndex> {
        match self.spatial_strategy {
            SpatialStrategy::Naive => Box::new(NaiveIndex::new()),
            SpatialStrategy::Partitioned => Box::new(UniformGridIndex::new(self.grid_cell_size)),
        }
    }
}

/// Pipeline phase in which a strategy fault was contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyPhase {
    Reaction,
    Interaction,
    LifeCost,
}

/// Record of a contained per-organism strategy failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyFault {
    pub organism: EntityId,
    pub phase: StrategyPhase,
}

/// Aggregated outcome of one pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: u64,
    pub organism_count: usize,
    pub food_count: usize,
    pub births: usize,
    pub deaths: usize,
    pub food_eaten: usize,
    pub strategy_faults: usize,
}

/// Read-only copy of an organism's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrganismSnapshot {
    pub id: EntityId,
    pub position: Position,
    pub genome: Genome,
    pub speed: f32,
    pub size: f32,
    pub awareness: f32,
    pub life_span: f32,
    pub alive: bool,
}

/// Read-only copy of a food entity's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoodSnapshot {
    pub id: EntityId,
    pub position: Position,
    pub energy: f32,
    pub edible: bool,
}

/// Either kind of resident entity, as returned by `all_objects`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntitySnapshot {
    Organism(OrganismSnapshot),
    Food(FoodSnapshot),
}

#[derive(Debug, Clone, Copy)]
struct SnapshotEntry {
    id: EntityId,
    position: Position,
    detail: NeighborDetail,
}

#[derive(Debug, Default)]
struct WorldSnapshot {
    positions: Vec<(f32, f32)>,
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PerceiveOutcome {
    intent: Option<MoveIntent>,
    faulted: bool,
}

#[derive(Debug, Default)]
struct InteractionOutcome {
    gained: f32,
    consumed: Vec<usize>,
    killed: Vec<usize>,
    faulted: bool,
}

struct SpawnOrder {
    parent_index: usize,
    position: Position,
    organism: Organism,
}

fn organism_view(id: EntityId, position: Position, organism: &Organism) -> OrganismView {
    OrganismView {
        id,
        position,
        speed: organism.traits.speed,
        size: organism.traits.size,
        awareness: organism.traits.awareness,
        life_span: organism.life_span,
    }
}

fn snapshot_organism(id: EntityId, position: Position, organism: &Organism) -> OrganismSnapshot {
    OrganismSnapshot {
        id,
        position,
        genome: organism.genome,
        speed: organism.traits.speed,
        size: organism.traits.size,
        awareness: organism.traits.awareness,
        life_span: organism.life_span,
        alive: organism.alive,
    }
}

/// Default reaction: head for the nearest edible food, stand still otherwise.
fn default_reaction(view: &OrganismView, neighbors: &[Neighbor]) -> MoveIntent {
    neighbors
        .iter()
        .find(|n| n.detail.is_edible_food())
        .map_or(MoveIntent::stay(), |food| {
            MoveIntent::toward(view.position, food.position)
        })
}

/// Default interaction: consume every edible food within reach.
fn default_interaction(_view: &OrganismView, neighbors: &[Neighbor]) -> Vec<InteractionCommand> {
    neighbors
        .iter()
        .filter(|n| n.detail.is_edible_food())
        .map(|n| InteractionCommand::Consume(n.id))
        .collect()
}

fn run_reaction(
    organism: &Organism,
    view: &OrganismView,
    neighbors: &[Neighbor],
) -> Result<MoveIntent, ()> {
    let result = match &organism.behaviors.reaction {
        Some(strategy) => panic::catch_unwind(AssertUnwindSafe(|| strategy(view, neighbors))),
        None => Ok(default_reaction(view, neighbors)),
    };
    match result {
        Ok(intent) if intent.is_finite() => Ok(intent),
        _ => Err(()),
    }
}

fn run_interaction(
    organism: &Organism,
    view: &OrganismView,
    neighbors: &[Neighbor],
) -> Result<Vec<InteractionCommand>, ()> {
    match &organism.behaviors.interaction {
        Some(strategy) => {
            panic::catch_unwind(AssertUnwindSafe(|| strategy(view, neighbors))).map_err(|_| ())
        }
        None => Ok(default_interaction(view, neighbors)),
    }
}

fn run_life_cost(organism: &Organism, view: &OrganismView, default_decay: f32) -> Result<f32, ()> {
    let result = match &organism.behaviors.life_cost {
        Some(strategy) => panic::catch_unwind(AssertUnwindSafe(|| strategy(view))),
        None => Ok(default_decay),
    };
    match result {
        Ok(cost) if cost.is_finite() => Ok(cost),
        _ => Err(()),
    }
}

/// Gather neighbors of `center` within `radius`, excluding the subject's own
/// slot, sorted by distance with assignment order as the tie-break.
fn collect_neighbors(
    index: &dyn SpatialIndex,
    entries: &[SnapshotEntry],
    subject_slot: usize,
    center: Position,
    radius: f32,
) -> Vec<Neighbor> {
    let mut hits: Vec<(OrderedFloat<f32>, usize)> = Vec::new();
    index.neighbors_within(center.x, center.y, radius, &mut |slot, distance| {
        if slot != subject_slot {
            hits.push((distance, slot));
        }
    });
    hits.sort_unstable();
    hits.into_iter()
        .map(|(distance, slot)| {
            let entry = entries[slot];
            Neighbor {
                id: entry.id,
                position: entry.position,
                distance: distance.into_inner(),
                detail: entry.detail,
            }
        })
        .collect()
}

fn clamp_coordinate(value: f32, extent: f32) -> f32 {
    value.clamp(0.0, (extent - POSITION_EPSILON).max(0.0))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Aggregate root owning every entity, the spatial index, the worker pool,
/// and the tick pipeline.
pub struct Environment {
    config: EnvironmentConfig,
    tick: Tick,
    rng: SmallRng,
    entities: EntityArena,
    index: Box<dyn SpatialIndex>,
    pool: rayon::ThreadPool,
    dead_organisms: Vec<OrganismSnapshot>,
    food_consumed: usize,
    last_faults: Vec<StrategyFault>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("entities", &self.entities.len())
            .field("food_consumed", &self.food_consumed)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Construct an environment. Validation is synchronous: a bad config or
    /// an unbuildable worker pool is rejected here, never mid-run.
    pub fn new(config: EnvironmentConfig) -> Result<Self, EcosimError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .build()
            .map_err(|err| EcosimError::WorkerPool(err.to_string()))?;
        let rng = config.seeded_rng();
        let index = config.build_index();
        Ok(Self {
            tick: Tick::zero(),
            rng,
            entities: EntityArena::new(),
            index,
            pool,
            dead_organisms: Vec::new(),
            food_consumed: 0,
            last_faults: Vec::new(),
            history: VecDeque::with_capacity(config.history_capacity),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn organism_count(&self) -> usize {
        self.entities
            .records()
            .iter()
            .filter(|record| matches!(record.kind, EntityKind::Organism(_)))
            .count()
    }

    #[must_use]
    pub fn food_count(&self) -> usize {
        self.entities
            .records()
            .iter()
            .filter(|record| matches!(record.kind, EntityKind::Food(_)))
            .count()
    }

    /// Food consumed since the current `simulate_iteration` run began.
    #[must_use]
    pub const fn food_consumed_this_run(&self) -> usize {
        self.food_consumed
    }

    /// Faults contained during the most recent tick.
    #[must_use]
    pub fn strategy_faults(&self) -> &[StrategyFault] {
        &self.last_faults
    }

    /// Bounded ring of recent tick summaries, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<TickSummary> {
        &self.history
    }

    /// Place an organism. The position must lie inside the world rectangle.
    pub fn add_organism(
        &mut self,
        organism: Organism,
        position: Position,
    ) -> Result<EntityId, EcosimError> {
        self.check_bounds(position)?;
        Ok(self.entities.insert(EntityRecord {
            position,
            kind: EntityKind::Organism(organism),
        }))
    }

    /// Place a food pellet. The position must lie inside the world rectangle.
    pub fn add_food(&mut self, food: Food, position: Position) -> Result<EntityId, EcosimError> {
        self.check_bounds(position)?;
        Ok(self.entities.insert(EntityRecord {
            position,
            kind: EntityKind::Food(food),
        }))
    }

    /// Remove a resident food entity, returning it.
    pub fn remove_food(&mut self, id: EntityId) -> Result<Food, EcosimError> {
        match self.entities.get(id) {
            Some(record) if matches!(record.kind, EntityKind::Food(_)) => {}
            _ => return Err(EcosimError::UnknownEntity),
        }
        match self.entities.remove(id) {
            Some(EntityRecord {
                kind: EntityKind::Food(food),
                ..
            }) => Ok(food),
            _ => Err(EcosimError::UnknownEntity),
        }
    }

    /// Install a reaction strategy on a resident organism.
    pub fn set_reaction_strategy(
        &mut self,
        id: EntityId,
        strategy: Arc<ReactionFn>,
    ) -> Result<(), EcosimError> {
        match self.entities.get_mut(id) {
            Some(EntityRecord {
                kind: EntityKind::Organism(organism),
                ..
            }) => {
                organism.behaviors.reaction = Some(strategy);
                Ok(())
            }
            _ => Err(EcosimError::UnknownEntity),
        }
    }

    /// Install an interaction strategy on a resident organism.
    pub fn set_interaction_strategy(
        &mut self,
        id: EntityId,
        strategy: Arc<InteractionFn>,
    ) -> Result<(), EcosimError> {
        match self.entities.get_mut(id) {
            Some(EntityRecord {
                kind: EntityKind::Organism(organism),
                ..
            }) => {
                organism.behaviors.interaction = Some(strategy);
                Ok(())
            }
            _ => Err(EcosimError::UnknownEntity),
        }
    }

    /// Install a life-cost callback on a resident organism.
    pub fn set_life_cost(
        &mut self,
        id: EntityId,
        strategy: Arc<LifeCostFn>,
    ) -> Result<(), EcosimError> {
        match self.entities.get_mut(id) {
            Some(EntityRecord {
                kind: EntityKind::Organism(organism),
                ..
            }) => {
                organism.behaviors.life_cost = Some(strategy);
                Ok(())
            }
            _ => Err(EcosimError::UnknownEntity),
        }
    }

    /// Snapshot of a single resident organism, if present.
    #[must_use]
    pub fn organism(&self, id: EntityId) -> Option<OrganismSnapshot> {
        let record = self.entities.get(id)?;
        match &record.kind {
            EntityKind::Organism(organism) => Some(snapshot_organism(id, record.position, organism)),
            EntityKind::Food(_) => None,
        }
    }

    /// Snapshot of a single resident food entity, if present.
    #[must_use]
    pub fn food(&self, id: EntityId) -> Option<FoodSnapshot> {
        let record = self.entities.get(id)?;
        match &record.kind {
            EntityKind::Food(food) => Some(FoodSnapshot {
                id,
                position: record.position,
                energy: food.energy,
                edible: food.edible,
            }),
            EntityKind::Organism(_) => None,
        }
    }

    /// Snapshots of every resident organism, in dense storage order.
    #[must_use]
    pub fn all_organisms(&self) -> Vec<OrganismSnapshot> {
        self.entities
            .handles()
            .iter()
            .zip(self.entities.records())
            .filter_map(|(&id, record)| match &record.kind {
                EntityKind::Organism(organism) => {
                    Some(snapshot_organism(id, record.position, organism))
                }
                EntityKind::Food(_) => None,
            })
            .collect()
    }

    /// Snapshots of every resident food entity, in dense storage order.
    #[must_use]
    pub fn all_foods(&self) -> Vec<FoodSnapshot> {
        self.entities
            .handles()
            .iter()
            .zip(self.entities.records())
            .filter_map(|(&id, record)| match &record.kind {
                EntityKind::Food(food) => Some(FoodSnapshot {
                    id,
                    position: record.position,
                    energy: food.energy,
                    edible: food.edible,
                }),
                EntityKind::Organism(_) => None,
            })
            .collect()
    }

    /// Snapshots of every resident entity, in dense storage order.
    #[must_use]
    pub fn all_objects(&self) -> Vec<EntitySnapshot> {
        self.entities
            .handles()
            .iter()
            .zip(self.entities.records())
            .map(|(&id, record)| match &record.kind {
                EntityKind::Organism(organism) => {
                    EntitySnapshot::Organism(snapshot_organism(id, record.position, organism))
                }
                EntityKind::Food(food) => EntitySnapshot::Food(FoodSnapshot {
                    id,
                    position: record.position,
                    energy: food.energy,
                    edible: food.edible,
                }),
            })
            .collect()
    }

    /// Drain the dead-organism accumulator. Each death is reported once.
    pub fn dead_organisms(&mut self) -> Vec<OrganismSnapshot> {
        std::mem::take(&mut self.dead_organisms)
    }

    /// Restore the environment to its freshly constructed state: no
    /// entities, tick zero, counters cleared, RNG reseeded.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.dead_organisms.clear();
        self.food_consumed = 0;
        self.last_faults.clear();
        self.history.clear();
        self.tick = Tick::zero();
        self.rng = self.config.seeded_rng();
        self.index = self.config.build_index();
    }

    /// Run `steps` ticks back to back. The food-consumed counter restarts at
    /// zero for the run.
    pub fn simulate_iteration(&mut self, steps: u64) -> Result<(), EcosimError> {
        self.simulate_iteration_with(steps, |_| {})
    }

    /// Run `steps` ticks, invoking `on_each_iteration` strictly between
    /// ticks with a shared view of the world. Reentrant stepping from the
    /// callback is impossible by construction.
    pub fn simulate_iteration_with(
        &mut self,
        steps: u64,
        mut on_each_iteration: impl FnMut(&Environment),
    ) -> Result<(), EcosimError> {
        self.food_consumed = 0;
        for _ in 0..steps {
            self.step()?;
            on_each_iteration(&*self);
        }
        Ok(())
    }

    /// Advance the world by one tick.
    pub fn step(&mut self) -> Result<TickSummary, EcosimError> {
        self.last_faults.clear();

        let snapshot = self.build_snapshot();
        self.index.rebuild(&snapshot.positions)?;
        let intents = self.stage_perceive(&snapshot)?;
        self.stage_move(&intents);

        // Interactions run against an index reflecting post-move positions.
        let snapshot = self.build_snapshot();
        self.index.rebuild(&snapshot.positions)?;
        let (food_eaten, eaten_ids) = self.stage_interact(&snapshot)?;
        self.food_consumed += food_eaten;

        let spawns = self.stage_reproduction();
        let mut evictions: HashSet<EntityId> = eaten_ids.into_iter().collect();
        let deaths = self.stage_age_and_cull(&mut evictions);
        let births = self.stage_spawn_commit(spawns);
        self.stage_rebuild(&evictions)?;

        self.tick = self.tick.next();
        let summary = TickSummary {
            tick: self.tick.value(),
            organism_count: self.organism_count(),
            food_count: self.food_count(),
            births,
            deaths,
            food_eaten,
            strategy_faults: self.last_faults.len(),
        };
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        debug!(
            target: "ecosim",
            tick = summary.tick,
            organisms = summary.organism_count,
            foods = summary.food_count,
            births = summary.births,
            deaths = summary.deaths,
            "tick complete"
        );
        Ok(summary)
    }

    fn check_bounds(&self, position: Position) -> Result<(), EcosimError> {
        let inside = position.x.is_finite()
            && position.y.is_finite()
            && position.x >= 0.0
            && position.y >= 0.0
            && position.x < self.config.width
            && position.y < self.config.height;
        if inside {
            Ok(())
        } else {
            Err(EcosimError::OutOfBounds {
                x: position.x,
                y: position.y,
                width: self.config.width,
                height: self.config.height,
            })
        }
    }

    fn build_snapshot(&self) -> WorldSnapshot {
        let mut positions = Vec::with_capacity(self.entities.len());
        let mut entries = Vec::with_capacity(self.entities.len());
        for (slot, record) in self.entities.records().iter().enumerate() {
            positions.push((record.position.x, record.position.y));
            let detail = match &record.kind {
                EntityKind::Organism(organism) => NeighborDetail::Organism {
                    size: organism.traits.size,
                    speed: organism.traits.speed,
                    life_span: organism.life_span,
                    alive: organism.alive,
                },
                EntityKind::Food(food) => NeighborDetail::Food {
                    energy: food.energy,
                    edible: food.edible,
                },
            };
            entries.push(SnapshotEntry {
                id: self.entities.handles()[slot],
                position: record.position,
                detail,
            });
        }
        WorldSnapshot { positions, entries }
    }

    fn run_parallel<T: Send>(&self, task: impl FnOnce() -> T + Send) -> Result<T, EcosimError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.pool.install(task)))
            .map_err(|payload| EcosimError::Concurrency(panic_message(payload.as_ref())))
    }

    fn record_fault(&mut self, organism: EntityId, phase: StrategyPhase) {
        warn!(target: "ecosim", ?organism, ?phase, "strategy fault contained");
        self.last_faults.push(StrategyFault { organism, phase });
    }

    fn stage_perceive(
        &mut self,
        snapshot: &WorldSnapshot,
    ) -> Result<Vec<PerceiveOutcome>, EcosimError> {
        let outcomes: Vec<PerceiveOutcome> = {
            let entities = &self.entities;
            let index = self.index.as_ref();
            self.run_parallel(|| {
                entities
                    .records()
                    .par_iter()
                    .enumerate()
                    .map(|(slot, record)| {
                        let EntityKind::Organism(organism) = &record.kind else {
                            return PerceiveOutcome::default();
                        };
                        if !organism.alive {
                            debug!(target: "ecosim", "skipping strategy call on dead organism");
                            return PerceiveOutcome::default();
                        }
                        let view =
                            organism_view(entities.handles()[slot], record.position, organism);
                        let neighbors = collect_neighbors(
                            index,
                            &snapshot.entries,
                            slot,
                            record.position,
                            organism.reaction_radius(),
                        );
                        match run_reaction(organism, &view, &neighbors) {
                            Ok(intent) => PerceiveOutcome {
                                intent: Some(intent),
                                faulted: false,
                            },
                            Err(()) => PerceiveOutcome {
                                intent: None,
                                faulted: true,
                            },
                        }
                    })
                    .collect()
            })?
        };
        for (slot, outcome) in outcomes.iter().enumerate() {
            if outcome.faulted {
                let id = self.entities.handles()[slot];
                self.record_fault(id, StrategyPhase::Reaction);
            }
        }
        Ok(outcomes)
    }

    fn stage_move(&mut self, outcomes: &[PerceiveOutcome]) {
        let width = self.config.width;
        let height = self.config.height;
        for (slot, outcome) in outcomes.iter().enumerate() {
            let Some(intent) = outcome.intent else {
                continue;
            };
            let record = &mut self.entities.records_mut()[slot];
            let EntityKind::Organism(organism) = &record.kind else {
                continue;
            };
            let length = (intent.dx * intent.dx + intent.dy * intent.dy).sqrt();
            if length <= f32::EPSILON {
                continue;
            }
            let stride = organism.traits.speed / length;
            record.position.x = clamp_coordinate(record.position.x + intent.dx * stride, width);
            record.position.y = clamp_coordinate(record.position.y + intent.dy * stride, height);
        }
    }

    /// Parallel interaction pass. Each food or kill target is protected by a
    /// per-slot claim; the first CAS winner takes the effect and every loser
    /// degrades to the idempotent no-op. Effects are applied in a sequential
    /// merge so workers never write shared state.
    fn stage_interact(
        &mut self,
        snapshot: &WorldSnapshot,
    ) -> Result<(usize, Vec<EntityId>), EcosimError> {
        let claims: Vec<AtomicBool> = (0..snapshot.entries.len())
            .map(|_| AtomicBool::new(false))
            .collect();
        let outcomes: Vec<InteractionOutcome> = {
            let entities = &self.entities;
            let index = self.index.as_ref();
            let claims = &claims;
            self.run_parallel(|| {
                entities
                    .records()
                    .par_iter()
                    .enumerate()
                    .map(|(slot, record)| {
                        let EntityKind::Organism(organism) = &record.kind else {
                            return InteractionOutcome::default();
                        };
                        if !organism.alive {
                            debug!(target: "ecosim", "skipping strategy call on dead organism");
                            return InteractionOutcome::default();
                        }
                        let view =
                            organism_view(entities.handles()[slot], record.position, organism);
                        let neighbors = collect_neighbors(
                            index,
                            &snapshot.entries,
                            slot,
                            record.position,
                            organism.interaction_radius(),
                        );
                        let commands = match run_interaction(organism, &view, &neighbors) {
                            Ok(commands) => commands,
                            Err(()) => {
                                return InteractionOutcome {
                                    faulted: true,
                                    ..InteractionOutcome::default()
                                };
                            }
                        };
                        let mut outcome = InteractionOutcome::default();
                        for command in commands {
                            match command {
                                InteractionCommand::Consume(target) => {
                                    let Some(target_slot) = entities.index_of(target) else {
                                        continue;
                                    };
                                    let entry = snapshot.entries[target_slot];
                                    if entry.id != target || !entry.detail.is_edible_food() {
                                        continue;
                                    }
                                    if claims[target_slot]
                                        .compare_exchange(
                                            false,
                                            true,
                                            Ordering::AcqRel,
                                            Ordering::Acquire,
                                        )
                                        .is_ok()
                                    {
                                        if let NeighborDetail::Food { energy, .. } = entry.detail {
                                            outcome.gained += energy;
                                        }
                                        outcome.consumed.push(target_slot);
                                    }
                                }
                                InteractionCommand::Attack(target) => {
                                    if target == view.id {
                                        continue;
                                    }
                                    let Some(target_slot) = entities.index_of(target) else {
                                        continue;
                                    };
                                    let entry = snapshot.entries[target_slot];
                                    if entry.id != target || !entry.detail.is_live_organism() {
                                        continue;
                                    }
                                    if claims[target_slot]
                                        .compare_exchange(
                                            false,
                                            true,
                                            Ordering::AcqRel,
                                            Ordering::Acquire,
                                        )
                                        .is_ok()
                                    {
                                        if let NeighborDetail::Organism { life_span, .. } =
                                            entry.detail
                                        {
                                            outcome.gained += life_span.max(0.0);
                                        }
                                        outcome.killed.push(target_slot);
                                    }
                                }
                            }
                        }
                        outcome
                    })
                    .collect()
            })?
        };

        let mut food_eaten = 0;
        let mut eaten_ids = Vec::new();
        for (slot, outcome) in outcomes.iter().enumerate() {
            if outcome.faulted {
                let id = self.entities.handles()[slot];
                self.record_fault(id, StrategyPhase::Interaction);
                continue;
            }
            if outcome.gained > 0.0 {
                if let EntityKind::Organism(organism) = &mut self.entities.records_mut()[slot].kind
                {
                    organism.life_span += outcome.gained;
                }
            }
            for &target_slot in &outcome.consumed {
                if let EntityKind::Food(food) = &mut self.entities.records_mut()[target_slot].kind {
                    if food.eaten() > 0.0 {
                        food_eaten += 1;
                        eaten_ids.push(self.entities.handles()[target_slot]);
                    }
                }
            }
            for &target_slot in &outcome.killed {
                if let EntityKind::Organism(victim) =
                    &mut self.entities.records_mut()[target_slot].kind
                {
                    if victim.alive {
                        victim.alive = false;
                        victim.life_span = 0.0;
                    }
                }
            }
        }
        Ok((food_eaten, eaten_ids))
    }

    fn stage_reproduction(&mut self) -> Vec<SpawnOrder> {
        let threshold = self.config.reproduction_threshold;
        let rate = self.config.mutation_rate;
        let magnitude = self.config.mutation_magnitude;
        let mut orders = Vec::new();
        for (slot, record) in self.entities.records.iter_mut().enumerate() {
            let EntityKind::Organism(organism) = &mut record.kind else {
                continue;
            };
            if !organism.can_reproduce(threshold) {
                continue;
            }
            let child = organism.reproduce(rate, magnitude, &mut self.rng);
            orders.push(SpawnOrder {
                parent_index: slot,
                position: record.position,
                organism: child,
            });
        }
        orders
    }

    fn stage_age_and_cull(&mut self, evictions: &mut HashSet<EntityId>) -> usize {
        let decay = self.config.base_life_decay;
        let mut faulted = Vec::new();
        let mut perished = Vec::new();
        {
            let handles = self.entities.handles().to_vec();
            for (slot, record) in self.entities.records_mut().iter_mut().enumerate() {
                let id = handles[slot];
                let position = record.position;
                let EntityKind::Organism(organism) = &mut record.kind else {
                    continue;
                };
                if organism.alive {
                    let view = organism_view(id, position, organism);
                    let cost = match run_life_cost(organism, &view, decay) {
                        Ok(cost) => cost,
                        Err(()) => {
                            faulted.push(id);
                            decay
                        }
                    };
                    organism.life_span -= cost;
                    if organism.life_span <= 0.0 {
                        organism.life_span = 0.0;
                        organism.alive = false;
                    }
                }
                if !organism.alive && evictions.insert(id) {
                    perished.push(snapshot_organism(id, position, organism));
                }
            }
        }
        for id in faulted {
            self.record_fault(id, StrategyPhase::LifeCost);
        }
        let deaths = perished.len();
        self.dead_organisms.extend(perished);
        deaths
    }

    fn stage_spawn_commit(&mut self, mut orders: Vec<SpawnOrder>) -> usize {
        orders.sort_by_key(|order| order.parent_index);
        let births = orders.len();
        for order in orders {
            self.entities.insert(EntityRecord {
                position: order.position,
                kind: EntityKind::Organism(order.organism),
            });
        }
        births
    }

    fn stage_rebuild(&mut self, evictions: &HashSet<EntityId>) -> Result<(), EcosimError> {
        self.entities.remove_many(evictions);
        let positions: Vec<(f32, f32)> = self
            .entities
            .records()
            .iter()
            .map(|record| (record.position.x, record.position.y))
            .collect();
        self.index.rebuild(&positions)?;
        Ok(())
    }
}
