//! # Driving Port
//!
//! What instance code looks like to the runtime. A production host would
//! implement this over an embedded bytecode engine; tests implement it
//! directly.

use crate::errors::HostError;
use crate::host::HostContext;
use async_trait::async_trait;
use shared_types::Payload;

/// Loadable instance code.
///
/// `function` is always one of the names exported by the instance's manifest;
/// the runtime rejects anything else before calling in. All host access goes
/// through `host`, which only carries the functions bound at load time.
#[async_trait]
pub trait SandboxModule: Send + Sync {
    async fn call(
        &self,
        function: &str,
        host: &HostContext,
        input: Payload,
    ) -> Result<Payload, HostError>;
}
