pub mod helpers;

mod delivery;
mod scaling;
