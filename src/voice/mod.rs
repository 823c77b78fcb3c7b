pub mod cipher;
pub mod discovery;
pub mod gateway;
pub mod session;

pub use cipher::EncryptionMode;
pub use gateway::{
    GatewayCommand, GatewayEvent, GatewayHandle, VoiceGatewayClient, VoiceServerInfo,
    state::GatewayState,
};
pub use session::{Payload, RtpCounters, VoiceLink, VoiceSession};
