pub mod combinatorics;
pub mod noise;
pub mod privacy_params;
