pub mod attest;
pub mod config;
pub mod devices;
pub mod gpu;
pub mod matrix;
pub mod merkle;
pub mod outcome;
pub mod pow;
pub mod remote;
pub mod round;
pub mod score;
