//! CUDA context binding for GPUDirect registration.
//!
//! `ibv_reg_mr` on a device pointer only succeeds when the owning CUDA
//! context is current on the registering thread and the peer-memory kernel
//! module is loaded.

use crate::error::{Result, TransportError};
use std::sync::Arc;

pub struct CudaBinding {
    ordinal: usize,
    ctx: Arc<cudarc::driver::CudaContext>,
}

impl CudaBinding {
    /// Retain the primary context of GPU `ordinal`.
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = cudarc::driver::CudaContext::new(ordinal).map_err(|e| {
            TransportError::fabric(format!(
                "failed to create CUDA context for GPU {ordinal}: {e}"
            ))
        })?;
        tracing::debug!(ordinal, "CUDA context retained");
        Ok(Self { ordinal, ctx })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Make the context current on the calling thread.
    pub fn bind(&self) -> Result<()> {
        self.ctx.bind_to_thread().map_err(|e| {
            TransportError::fabric(format!(
                "CUDA bind_to_thread failed for GPU {}: {e}",
                self.ordinal
            ))
        })
    }
}
