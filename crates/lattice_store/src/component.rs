//! The closed set of component kinds and their value types.
//!
//! Component values are a tagged sum over concrete types rather than a
//! type-erased container: every kind has exactly one value type, fixed
//! at compile time, and per-kind accessors on the store hand out the
//! concrete type directly.

use glam::{Quat, Vec3};

use crate::EntityId;

/// Linear and angular velocity of an entity.
#[derive(Copy, Clone, PartialEq, Default, Debug)]
pub struct Velocity {
    pub linear: Vec3,
    pub angular: Vec3,
}

impl Velocity {
    #[must_use]
    pub fn linear(x: f32, y: f32, z: f32) -> Self {
        Self {
            linear: Vec3::new(x, y, z),
            angular: Vec3::ZERO,
        }
    }
}

/// Position, orientation and uniform scale of an entity.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Transform {
    pub translation: Vec3,
    pub orientation: Quat,
    pub scale: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: 1.0,
        }
    }
}

impl Transform {
    #[must_use]
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::default()
        }
    }
}

/// Collision volume attached to an entity, expressed in its reference
/// frame.
#[derive(Copy, Clone, PartialEq, Default, Debug)]
pub struct Collidable {
    pub half_extents: Vec3,
    pub offset: Vec3,
}

/// How a component kind is stored and who may touch it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StorageClass {
    /// Opaque to everyone but the owning system.
    PerSystem,
    /// Versioned, committed per tick, readable across threads.
    Shared,
    /// Small plain-old-data value with a single writer.
    Value,
}

/// Every component kind the engine knows about.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum ComponentKind {
    /// Instant displacement.
    Velocity,
    /// Maximum instant displacement.
    VelocityMax,
    /// Id of the parent entity for the transform.
    ReferenceFrame,
    /// True if this entity has at least one child frame.
    IsReferenceFrame,
    /// Velocity combined along the reference-frame chain.
    CombinedVelocity,
    /// Collision volume.
    Collidable,
    /// Oxygen rate associated with an entity (room, suit, ...).
    OxygenRate,
    /// Health level.
    Health,
    /// Exempt from damage.
    Immune,
    /// Transform used to display the entity.
    GraphicTransform,
    /// Last confirmed transform.
    GameTransform,
}

impl ComponentKind {
    pub const ALL: [Self; 11] = [
        Self::Velocity,
        Self::VelocityMax,
        Self::ReferenceFrame,
        Self::IsReferenceFrame,
        Self::CombinedVelocity,
        Self::Collidable,
        Self::OxygenRate,
        Self::Health,
        Self::Immune,
        Self::GraphicTransform,
        Self::GameTransform,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Velocity => "velocity",
            Self::VelocityMax => "velocity-max",
            Self::ReferenceFrame => "reference-frame",
            Self::IsReferenceFrame => "is-reference-frame",
            Self::CombinedVelocity => "combined-velocity",
            Self::Collidable => "collidable",
            Self::OxygenRate => "oxygen-rate",
            Self::Health => "health",
            Self::Immune => "immune",
            Self::GraphicTransform => "graphic-transform",
            Self::GameTransform => "game-transform",
        }
    }

    #[must_use]
    pub fn storage_class(self) -> StorageClass {
        match self {
            Self::Velocity
            | Self::VelocityMax
            | Self::GraphicTransform
            | Self::GameTransform => StorageClass::Shared,
            Self::CombinedVelocity | Self::Collidable => StorageClass::PerSystem,
            Self::ReferenceFrame
            | Self::IsReferenceFrame
            | Self::OxygenRate
            | Self::Health
            | Self::Immune => StorageClass::Value,
        }
    }
}

/// A component value paired with its kind tag.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ComponentValue {
    Velocity(Velocity),
    VelocityMax(Velocity),
    ReferenceFrame(EntityId),
    IsReferenceFrame(bool),
    CombinedVelocity(Velocity),
    Collidable(Collidable),
    OxygenRate(f32),
    Health(u32),
    Immune(bool),
    GraphicTransform(Transform),
    GameTransform(Transform),
}

impl ComponentValue {
    #[must_use]
    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Velocity(_) => ComponentKind::Velocity,
            Self::VelocityMax(_) => ComponentKind::VelocityMax,
            Self::ReferenceFrame(_) => ComponentKind::ReferenceFrame,
            Self::IsReferenceFrame(_) => ComponentKind::IsReferenceFrame,
            Self::CombinedVelocity(_) => ComponentKind::CombinedVelocity,
            Self::Collidable(_) => ComponentKind::Collidable,
            Self::OxygenRate(_) => ComponentKind::OxygenRate,
            Self::Health(_) => ComponentKind::Health,
            Self::Immune(_) => ComponentKind::Immune,
            Self::GraphicTransform(_) => ComponentKind::GraphicTransform,
            Self::GameTransform(_) => ComponentKind::GameTransform,
        }
    }
}
