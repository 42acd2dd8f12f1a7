use thiserror::Error;

/// Kernel-level failures. Recoverable operation failures (a duplicate name,
/// a full directory, a bad descriptor) are reported in-band as booleans and
/// sentinels; this type covers the I/O domain underneath them, which the
/// kernel treats as fatal to the affected operation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("disk i/o error: {0}")]
    Disk(#[from] std::io::Error),
}
