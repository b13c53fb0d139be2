mod loader;
mod schema;

pub use loader::{load, save};
pub use schema::{
    AutonomyLevel, Config, ProviderConfig, ProviderFamily, RoleConfig, ToolMode, ToolServerConfig,
};
