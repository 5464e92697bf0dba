mod grpc_frame;
mod ws;

pub use grpc_frame::{GrpcFrame, GrpcFrameCodec};
pub use ws::WebsocketTransport;
