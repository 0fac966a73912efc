//! Segment geometry: lines, circles, and rational B-splines.

pub mod circle;
pub mod line;
pub mod nurbs;

pub use circle::{Circle3, Circle9};
pub use line::{Line3, Line9};
pub use nurbs::{ControlPoint, NurbsBuilder, NurbsCurve};
