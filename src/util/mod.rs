pub mod aabb2;
pub mod vector;
