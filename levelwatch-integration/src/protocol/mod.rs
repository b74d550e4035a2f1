/// Websocket helpers over `tokio-tungstenite`: type aliases, connection
/// utilities and disconnect classification.
pub mod websocket;
