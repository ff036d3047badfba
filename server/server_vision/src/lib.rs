pub mod capture;
pub mod convergence;
pub mod processing;
pub mod simulated_capture;
pub mod storage;
