mod codec;
mod session;
mod transport;

pub use codec::Encoding;
pub use codec::Frame;
pub use codec::FrameCodec;
pub use codec::Inflater;
pub use codec::Opcode;
pub use codec::TermCodec;
pub use codec::WireMessage;
pub use codec::ZLIB_SUFFIX;
pub use session::GatewaySession;
pub use session::IdentifyConfig;
pub use session::IdentifyProperties;
pub use session::RequestGuildMembers;
pub use session::Session;
pub use session::SessionConfig;
pub use session::Status;
pub use session::RECONNECT_CLOSE_CODE;
pub use transport::Connector;
pub use transport::GatewaySocket;
pub use transport::Payload;
pub use transport::SocketEvent;
pub use transport::TlsConnector;
pub use transport::WsSocket;
