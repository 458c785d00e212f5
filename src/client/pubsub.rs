/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A connection dedicated to receiving messages on a fixed set of channels

use std::sync::atomic::{AtomicBool, Ordering};

use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    client::connect::{self, RespConnection},
    config::{Endpoint, Settings},
    error::{self, ConnectionReason, Error},
    protocol::{FromResp, RespValue},
};

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubsubMessage {
    pub channel: String,
    pub payload: String,
}

/// Owns the subscription connection; messages are forwarded to the receiver returned by
/// `subscribe`, which ends when the connection does.
pub struct SubscriptionListener {
    endpoint: Endpoint,
    channels: Vec<String>,
    cancel: CancellationToken,
    finished: AtomicBool,
}

impl SubscriptionListener {
    /// Connect to `endpoint` and subscribe to each of `channels`, returning once every
    /// subscription is confirmed
    pub async fn subscribe(
        endpoint: &Endpoint,
        settings: &Settings,
        channels: &[&str],
        handle: &Handle,
    ) -> Result<(SubscriptionListener, mpsc::UnboundedReceiver<PubsubMessage>), Error> {
        let subscribing = async {
            let mut connection = connect::connect_with_auth(endpoint, settings).await?;
            let cmd = std::iter::once("SUBSCRIBE")
                .chain(channels.iter().copied())
                .map(RespValue::from)
                .collect();
            connection.send(RespValue::Array(cmd)).await?;
            for _ in channels {
                match connection.next().await {
                    Some(Ok(confirmation)) => confirm(confirmation)?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::Connection(ConnectionReason::NotConnected)),
                }
            }
            Ok::<_, Error>(connection)
        };
        let connection = tokio::time::timeout(settings.connect_timeout, subscribing)
            .await
            .map_err(|_| Error::Connection(ConnectionReason::Unreachable(endpoint.to_string())))??;

        let (tx, rx) = mpsc::unbounded();
        let cancel = CancellationToken::new();
        handle.spawn(forward(endpoint.clone(), connection, tx, cancel.clone()));
        log::debug!("Subscribed to {:?} on {}", channels, endpoint);

        Ok((
            SubscriptionListener {
                endpoint: endpoint.clone(),
                channels: channels.iter().map(|c| c.to_string()).collect(),
                cancel,
                finished: AtomicBool::new(false),
            },
            rx,
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Drop the subscription connection; the message receiver then ends
    pub fn close(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }
}

impl Drop for SubscriptionListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn confirm(confirmation: RespValue) -> Result<(), Error> {
    match confirmation {
        RespValue::Array(ref parts) if parts.len() == 3 => match &parts[0] {
            RespValue::BulkString(kind) if kind == b"subscribe" => Ok(()),
            _ => Err(error::unexpected("Expected a subscribe confirmation")),
        },
        RespValue::Error(e) => Err(Error::Remote(e)),
        other => Err(error::corrupt("Unexpected reply to SUBSCRIBE", other)),
    }
}

/// A `message` push is `[message, channel, payload]`, a `pmessage` one is
/// `[pmessage, pattern, channel, payload]`.  Anything else is not a message.
fn parse_message(msg: RespValue) -> Result<Option<PubsubMessage>, Error> {
    let mut parts = match msg {
        RespValue::Array(parts) => parts,
        other => {
            return Err(error::corrupt(
                "PUBSUB message should be encoded as an array",
                other,
            ))
        }
    };
    let kind = match parts.first().and_then(|k| k.as_text()) {
        Some(kind) => kind.into_owned(),
        None => return Err(error::unexpected("Incorrect format of a PUBSUB message")),
    };
    let expected = match kind.as_str() {
        "message" => 3,
        "pmessage" => 4,
        _ => return Ok(None),
    };
    if parts.len() != expected {
        return Err(error::unexpected(
            "Wrong number of parts for a PUBSUB message",
        ));
    }
    let payload = String::from_resp(parts.pop().unwrap_or(RespValue::Nil))?;
    let channel = String::from_resp(parts.pop().unwrap_or(RespValue::Nil))?;
    Ok(Some(PubsubMessage { channel, payload }))
}

async fn forward(
    endpoint: Endpoint,
    mut connection: RespConnection,
    tx: mpsc::UnboundedSender<PubsubMessage>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            next = connection.next() => next,
            _ = cancel.cancelled() => break,
        };
        match next {
            Some(Ok(msg)) => match parse_message(msg) {
                Ok(Some(message)) => {
                    if tx.unbounded_send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => (),
                Err(e) => log::warn!("Ignoring malformed message from {}: {}", endpoint, e),
            },
            Some(Err(e)) => {
                log::warn!("Subscription to {} failed: {}", endpoint, e);
                break;
            }
            None => {
                log::info!("Subscription connection to {} closed", endpoint);
                break;
            }
        }
    }
    cancel.cancel();
}
