pub mod mcp_serve;
pub mod plan;
pub mod run;
pub mod validate;
