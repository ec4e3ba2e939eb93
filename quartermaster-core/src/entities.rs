//! Location and requestable payloads

use crate::Tagged;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Stable position of a requester or resolver in the simulation world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub dimension: String,
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Location {
    pub fn new(dimension: impl Into<String>, x: i64, y: i64, z: i64) -> Self {
        Self {
            dimension: dimension.into(),
            x,
            y,
            z,
        }
    }

    /// Squared block distance, or `None` across dimensions.
    pub fn distance_squared(&self, other: &Location) -> Option<i64> {
        if self.dimension != other.dimension {
            return None;
        }
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        Some(dx * dx + dy * dy + dz * dz)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({}, {}, {})", self.dimension, self.x, self.y, self.z)
    }
}

/// What a request asks for.
///
/// Identity is structural: two payloads are equal when their values are.
/// Implemented automatically for every tagged, cloneable, comparable type,
/// so applications only write the data type and its [`Tagged`] impl.
pub trait Requestable: Tagged + fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn clone_boxed(&self) -> Box<dyn Requestable>;

    /// Value equality across the type-erased family.
    fn eq_dyn(&self, other: &dyn Requestable) -> bool;
}

impl<T> Requestable for T
where
    T: Tagged + Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_boxed(&self) -> Box<dyn Requestable> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn Requestable) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}
