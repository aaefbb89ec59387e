pub mod bridge;
pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod store;
pub mod topic;

pub use bridge::{Bridge, BridgeStats};
pub use broker::{MessagePublisher, MockPublisher};
pub use config::BridgeConfig;
pub use dispatcher::EventDispatcher;
pub use error::{BridgeError, Result};
pub use reconnect::{AckMode, ReconnectHandler};
pub use registry::{LivenessRegistry, LivenessState};
pub use router::MessageRouter;
pub use store::{BufferDiscipline, BufferStore, BufferedMessage, MemoryBufferStore, RedisBufferStore};
pub use topic::{BridgeEvent, ClientId, TopicScheme};
