//! Method set served by the demo node.

use serde::{Deserialize, Serialize};
use trirpc_core::{Bytes, ConnectionContext, MethodRegistry, RegistryError};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HelloResult {
    pub result: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EchoResult<T> {
    pub value: T,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WhoAmI {
    pub connection: String,
    pub remote: Option<String>,
}

async fn hello_world(name: String, num: i64) -> Result<HelloResult, String> {
    Ok(HelloResult {
        result: format!("hi {name} {num}"),
    })
}

async fn echo(arg: String) -> Result<EchoResult<String>, String> {
    Ok(EchoResult { value: arg })
}

async fn echo_int(arg: i64) -> Result<EchoResult<i64>, String> {
    Ok(EchoResult { value: arg })
}

async fn echo_bytes(arg: Bytes) -> Result<EchoResult<Bytes>, String> {
    Ok(EchoResult { value: arg })
}

async fn echo_ws(_ctx: ConnectionContext, arg: String) -> Result<EchoResult<String>, String> {
    Ok(EchoResult { value: arg })
}

async fn whoami(ctx: ConnectionContext) -> Result<WhoAmI, String> {
    Ok(WhoAmI {
        connection: ctx.connection_id().to_owned(),
        remote: ctx.remote_addr().map(str::to_owned),
    })
}

/// Build the registry served by `trirpc-node serve`.
pub fn registry() -> Result<MethodRegistry, RegistryError> {
    let mut reg = MethodRegistry::new();
    reg.register("hello_world", hello_world, &["name", "num"])?;
    reg.register("echo", echo, &["arg"])?;
    reg.register("echo_int", echo_int, &["arg"])?;
    reg.register("echo_bytes", echo_bytes, &["arg"])?;
    reg.register_ws("echo_ws", echo_ws, &["arg"])?;
    reg.register_ws("whoami", whoami, &[])?;
    Ok(reg)
}
