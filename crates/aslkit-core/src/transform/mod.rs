//! Transform algebra: rigid transforms, warp fields and their composition.

pub mod compose;
pub mod rigid;
pub mod trait_;
pub mod warp;

pub use compose::{combine_warps, warp_jacobian, CombinedWarp};
pub use rigid::{compose_rigid, invert_rigid, RigidTransform};
pub use trait_::Transform;
pub use warp::WarpField;
