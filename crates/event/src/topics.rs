//! Reserved names shared by engines and brokers.

/// Event type submitted once when an engine activates.
pub const INIT: &str = "__init__";

/// Discovery request: asks the addressed engine for its RPC method list.
pub const GET_RPC_METHODS: &str = "__GET_RPCMETHODS__";

/// Discovery response and self-announcement: maps method name to token.
pub const RPC_METHODS: &str = "__RPC_METHODS__";

/// Broadcast topic every engine subscribes to.
pub const BROADCAST: &str = "*";

/// Topic served by the broker itself.
pub const BROKER: &str = "__BROKER__";

/// Prefix of every private engine token.
pub const TOKEN_PREFIX: &str = "rpc_";
