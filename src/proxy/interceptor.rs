//! The pluggable per-connection interception seam.
//!
//! An interceptor sees the handshake parameters once and every frame in
//! both directions. For each frame it returns zero or more directed
//! [`Action`]s: none drops the frame, one forwards (possibly mutated or
//! redirected), several fabricate. Interceptors must not fail; a frame
//! an interceptor cannot make sense of is forwarded unchanged.

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::Message;

use crate::proxy::params::ConnectionParams;

/// Direction of travel of a frame, which doubles as the session an
/// action is emitted on: `ClientToServer` emits on the upstream session,
/// `ServerToClient` on the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// A directive produced by an interceptor for a single frame.
#[derive(Debug, Clone)]
pub struct Action {
    pub direction: Direction,
    pub frame: Message,
    /// Gracefully close the session right after sending the frame.
    pub send_and_close: bool,
}

impl Action {
    /// An action with the default close behavior: close after sending
    /// iff the frame is a CLOSE frame.
    pub fn new(direction: Direction, frame: Message) -> Self {
        let send_and_close = frame.is_close();
        Self {
            direction,
            frame,
            send_and_close,
        }
    }

    /// Close the session denoted by `direction` without sending anything
    /// beyond the close handshake.
    pub fn close(direction: Direction) -> Self {
        Self::new(direction, Message::Close(None))
    }
}

/// Per-connection interception logic.
///
/// One instance is shared by both forwarding tasks of a connection, so
/// implementations keep interior state in atomics or short-lived locks.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Rewrite the handshake query parameters. The returned set is
    /// applied to the upstream URL in the original key order.
    async fn intercept_connection(&self, params: ConnectionParams) -> ConnectionParams {
        params
    }

    /// Transform one inbound frame into the actions to perform.
    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action>;
}

/// The identity interceptor: every frame is forwarded as-is.
#[derive(Debug, Default)]
pub struct PassThroughInterceptor;

#[async_trait]
impl Interceptor for PassThroughInterceptor {
    async fn intercept_frame(&self, direction: Direction, frame: Message) -> Vec<Action> {
        vec![Action::new(direction, frame)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pass_through_forwards_unchanged() {
        let interceptor = PassThroughInterceptor;
        let frame = Message::Text("{\"action\":0}".to_string());
        let actions = interceptor
            .intercept_frame(Direction::ClientToServer, frame.clone())
            .await;

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].direction, Direction::ClientToServer);
        assert_eq!(actions[0].frame, frame);
        assert!(!actions[0].send_and_close);
    }

    #[tokio::test]
    async fn test_pass_through_keeps_params() {
        let interceptor = PassThroughInterceptor;
        let params = ConnectionParams::from_query("clientId=c1&resume=tok");
        let result = interceptor.intercept_connection(params.clone()).await;
        assert_eq!(result, params);
    }

    #[test]
    fn test_close_frames_default_to_send_and_close() {
        let action = Action::new(Direction::ServerToClient, Message::Close(None));
        assert!(action.send_and_close);

        let action = Action::new(
            Direction::ServerToClient,
            Message::Text("{\"action\":0}".to_string()),
        );
        assert!(!action.send_and_close);
    }

    #[test]
    fn test_direction_reversal() {
        assert_eq!(
            Direction::ClientToServer.reversed(),
            Direction::ServerToClient
        );
        assert_eq!(
            Direction::ServerToClient.reversed(),
            Direction::ClientToServer
        );
    }
}
