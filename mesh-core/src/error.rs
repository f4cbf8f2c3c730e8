use thiserror::Error;

/// Errors that can arise from the pure, I/O-free parts of the data model:
/// IP address management and config generation. The orchestration layer
/// (C4, in `mesh-server`) maps these onto the wire-level error kinds from
/// spec §7.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("prefix exhausted: no free host address remains")]
    Exhausted,

    #[error("address {0} is not assignable within this prefix")]
    NotAssignable(std::net::IpAddr),

    #[error("{0}")]
    Validation(String),
}
