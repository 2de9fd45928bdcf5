pub mod id;
pub mod snowflake;

pub use id::{prefixed_ulid, InstanceId};
pub use snowflake::SnowflakeGenerator;
