pub mod resolver;

pub use resolver::{LockedField, ParameterResolver, Resolution, TargetSet};
