//! Relay Pool (C2) — outbound sessions to the configured relay set (§4.2).
//!
//! `daemon/src/relay/mod.rs` hand-rolled the reconnect loop, exponential
//! backoff, and event-id dedup over a raw WebSocket because it spoke a
//! bespoke wire protocol. Here the wire protocol *is* Nostr, so
//! `nostr_sdk::Client`/`RelayPool` already implements all three (per-relay
//! backoff with jitter, a `RelayPoolNotification::Event` stream deduped by
//! event id) — this module is a thin policy wrapper, not a reimplementation.

use anyhow::{bail, Result};
use nostr_sdk::prelude::*;
use std::time::Duration;
use tracing::{info, warn};

pub const REQUEST_KIND: Kind = Kind::Custom(23194);
pub const RESPONSE_KIND: Kind = Kind::Custom(23195);

const STARTUP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayPool {
    client: Client,
}

impl RelayPool {
    /// Add every configured relay and attempt an initial connection to each.
    /// Per SPEC_FULL.md: if zero relays connect, startup is fatal; if at
    /// least one connects, the rest keep retrying in the background under
    /// the pool's own reconnect policy (§4.2).
    pub async fn connect(keys: Keys, relay_urls: &[String]) -> Result<Self> {
        let client = Client::new(keys);
        for url in relay_urls {
            client.add_relay(url.as_str()).await?;
        }
        client.connect().await;
        client.wait_for_connection(STARTUP_CONNECT_TIMEOUT).await;

        let connected = client
            .relays()
            .await
            .values()
            .filter(|r| r.status() == RelayStatus::Connected)
            .count();

        if connected == 0 {
            bail!("no relay connected within {:?} of startup", STARTUP_CONNECT_TIMEOUT);
        }
        if connected < relay_urls.len() {
            warn!(connected, configured = relay_urls.len(), "some relays failed to connect at startup; retrying in background");
        } else {
            info!(connected, "all configured relays connected");
        }

        Ok(Self { client })
    }

    /// Subscribe to request envelopes addressed to `our_pubkey`.
    pub async fn subscribe_requests(&self, our_pubkey: PublicKey) -> Result<()> {
        let filter = Filter::new()
            .kind(REQUEST_KIND)
            .pubkey(our_pubkey)
            .since(Timestamp::now());
        self.client.subscribe(filter, None).await?;
        Ok(())
    }

    /// Sign and publish `builder` under the pool's signer, succeeding if at
    /// least one relay accepts it (§4.2).
    pub async fn publish(&self, builder: EventBuilder) -> Result<EventId> {
        let output = self.client.send_event_builder(builder).await?;
        Ok(output.val)
    }

    /// Drive the notification loop. `on_request` is invoked once per unique
    /// inbound request event; return `true` from it to stop the loop
    /// (graceful shutdown).
    pub async fn run<F, Fut>(&self, on_request: F) -> Result<()>
    where
        F: Fn(Event) -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        self.client
            .handle_notifications(|notification| {
                let on_request = &on_request;
                async move {
                    if let RelayPoolNotification::Event { event, .. } = notification {
                        if event.kind == REQUEST_KIND {
                            return on_request(*event)
                                .await
                                .map_err(|e| Box::<dyn std::error::Error>::from(e.to_string()));
                        }
                    }
                    Ok(false)
                }
            })
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.client.disconnect().await;
    }
}
