//! Handler extension points.
//!
//! A verb handler resolves one [`CallHooks`] implementation at construction
//! and calls its methods at fixed points of the call; every method defaults
//! to a no-op, so implementors override only what they need. Hooks that want
//! to end the call early set the context's `complete` flag; hooks that need
//! to observe the transaction outcome register commit/rollback listeners on
//! the context's [`CallControl`](crate::tx::CallControl).

use async_trait::async_trait;

use crate::Result;

/// Extension hooks around one operation's phase chain, generic over that
/// operation's context type.
#[async_trait]
pub trait CallHooks<C>: Send + Sync
where
    C: Send,
{
    /// Before a connection is acquired.
    async fn prepare(&self, _context: &mut C) -> Result<()> {
        Ok(())
    }

    /// Inside the transaction, before the operation's main phase.
    async fn before(&self, _context: &mut C) -> Result<()> {
        Ok(())
    }

    /// Inside the transaction, after the operation's main phase.
    async fn after(&self, _context: &mut C) -> Result<()> {
        Ok(())
    }

    /// After the transaction outcome is settled and the connection released.
    async fn complete(&self, _context: &mut C) -> Result<()> {
        Ok(())
    }
}

/// The hooks used when a handler is constructed without extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

#[async_trait]
impl<C: Send> CallHooks<C> for NoHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{PhaseContext, ReadContext};

    struct ShortCircuitingHooks;

    #[async_trait]
    impl CallHooks<ReadContext> for ShortCircuitingHooks {
        async fn before(&self, context: &mut ReadContext) -> Result<()> {
            context.control_mut().set_complete();
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_methods_are_no_ops() {
        let mut cx = ReadContext::new("Order", "17");
        NoHooks.prepare(&mut cx).await.unwrap();
        NoHooks.before(&mut cx).await.unwrap();
        NoHooks.after(&mut cx).await.unwrap();
        NoHooks.complete(&mut cx).await.unwrap();
        assert!(!cx.control().is_complete());
    }

    #[tokio::test]
    async fn overridden_hook_can_complete_the_call() {
        let mut cx = ReadContext::new("Order", "17");
        ShortCircuitingHooks.before(&mut cx).await.unwrap();
        assert!(cx.control().is_complete());
    }
}
