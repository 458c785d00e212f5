/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::codec::{Decoder, Framed};

use crate::{
    client::socket::BufferedSocket,
    config::{Endpoint, Settings},
    error::{self, ConnectionReason, Error},
    protocol::{FromResp, RespCodec, RespValue},
    role::{self, Role, ServerMode, SlotRange},
};

pub(crate) type RespConnection = Framed<TcpStream, RespCodec>;

/// What the server told us about itself while connecting
#[derive(Debug, Clone)]
pub(crate) struct ServerInfo {
    pub(crate) role: Role,
    pub(crate) mode: Option<ServerMode>,
    pub(crate) slots: Vec<SlotRange>,
}

/// Resolve `endpoint` and open a TCP connection to the first address that accepts one
async fn open(endpoint: &Endpoint, settings: &Settings) -> Result<TcpStream, Error> {
    let addrs: Vec<_> = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|_| Error::Connection(ConnectionReason::Unresolvable(endpoint.to_string())))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Connection(ConnectionReason::Unresolvable(
            endpoint.to_string(),
        )));
    }
    for addr in addrs {
        match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => log::debug!("Cannot connect to {} ({}): {}", endpoint, addr, e),
            Err(_) => log::debug!("Timed out connecting to {} ({})", endpoint, addr),
        }
    }
    Err(Error::Connection(ConnectionReason::Unreachable(
        endpoint.to_string(),
    )))
}

/// Send one request and read its reply
pub(crate) async fn request(
    connection: &mut RespConnection,
    msg: RespValue,
) -> Result<RespValue, Error> {
    connection.send(msg).await?;
    match connection.next().await {
        Some(value) => value,
        None => Err(Error::Connection(ConnectionReason::NotConnected)),
    }
}

/// Connect and authenticate, returning a framed connection for reading and writing `RESP`
/// values directly
pub(crate) async fn connect_with_auth(
    endpoint: &Endpoint,
    settings: &Settings,
) -> Result<RespConnection, Error> {
    let stream = open(endpoint, settings).await?;
    let mut connection = RespCodec.framed(stream);

    if let Some(password) = &settings.password {
        let mut auth: Vec<RespValue> = vec!["AUTH".into()];
        if let Some(username) = &settings.username {
            auth.push(username.clone().into());
        }
        auth.push(password.clone().into());

        let reply = request(&mut connection, RespValue::Array(auth)).await?;
        <()>::from_resp(reply)?;
    }

    Ok(connection)
}

async fn discover_role(connection: &mut RespConnection) -> Result<Role, Error> {
    let reply = request(connection, resp_array!["ROLE"]).await?;
    match role::role_from_resp(&reply) {
        Ok(role) => return Ok(role),
        Err(e) => log::debug!("ROLE unavailable, falling back to INFO: {}", e),
    }
    let info = request(connection, resp_array!["INFO", "replication"]).await?;
    let info = String::from_resp(info)?;
    Ok(role::role_from_info(&info).unwrap_or(Role::Undefined))
}

/// Everything sent on a fresh connection before it carries commands: client name, then role,
/// mode and slot discovery
pub(crate) async fn handshake(
    connection: &mut RespConnection,
    settings: &Settings,
) -> Result<ServerInfo, Error> {
    if let Some(name) = &settings.client_name {
        let reply = request(connection, resp_array!["CLIENT", "SETNAME", name.clone()]).await?;
        <()>::from_resp(reply)?;
    }

    let role = discover_role(connection).await?;

    let mode = if role == Role::Sentinel {
        Some(ServerMode::Sentinel)
    } else {
        let info = request(connection, resp_array!["INFO", "server"]).await?;
        String::from_resp(info)
            .ok()
            .and_then(|info| role::mode_from_info(&info))
    };

    let mut slots = Vec::new();
    if mode == Some(ServerMode::Cluster) {
        let reply = request(connection, resp_array!["CLUSTER", "SLOTS"]).await?;
        match role::slots_from_resp(reply) {
            Ok(parsed) => slots = parsed,
            Err(e) => log::warn!("Cannot read cluster slots: {}", e),
        }
    }

    Ok(ServerInfo { role, mode, slots })
}

/// Open a command connection: connect, authenticate and handshake, all within the connect timeout
pub(crate) async fn connect(
    endpoint: &Endpoint,
    settings: &Settings,
    handle: Handle,
) -> Result<(BufferedSocket, ServerInfo), Error> {
    let connecting = async {
        let mut connection = connect_with_auth(endpoint, settings).await?;
        let info = handshake(&mut connection, settings).await?;
        Ok::<_, Error>((connection, info))
    };
    let (connection, info) = tokio::time::timeout(settings.connect_timeout, connecting)
        .await
        .map_err(|_| {
            Error::Connection(ConnectionReason::Unreachable(endpoint.to_string()))
        })??;

    let parts = connection.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(error::unexpected(format!(
            "Unsolicited data from {} during handshake",
            endpoint
        )));
    }
    let socket = BufferedSocket::new(parts.io, endpoint.clone(), settings, handle)?;
    log::info!(
        "Connected to {} (role: {}, mode: {:?})",
        endpoint,
        info.role,
        info.mode
    );
    Ok((socket, info))
}
