pub mod attention;
pub mod blocks;
pub mod decoder;
pub mod dense;
pub mod layers;
pub mod linear;
pub mod params;
pub mod solver;
