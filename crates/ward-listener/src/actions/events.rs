//! Event subscription: `events`.

use async_trait::async_trait;
use tracing::info;

use ward_core::Options;

use crate::router::{ActionHandler, Reply, RequestContext};

/// Hand the connection over to the broadcaster. Nothing is sent until
/// the next event; there is no unsubscribe, the subscription ends with
/// the connection.
pub struct Subscribe;

#[async_trait]
impl ActionHandler for Subscribe {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        info!(sender = %ctx.sender, "event subscription");
        Reply::Stream(ctx.agent.broadcaster.subscribe(ctx.encoder.clone()))
    }
}
