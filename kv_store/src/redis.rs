use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fred::prelude::*;
use futures::StreamExt;
use log::warn;
use wire::RouterError;

use crate::store::{KvStore, KvSubscription, SetMode};

/// The production K/V store adapter, backed by Redis (or anything
/// speaking its wire protocol) via `fred`.
///
/// Two client handles are kept: a regular `Client` for the key/value and
/// publish operations, and a `SubscriberClient`, which tracks its own
/// subscriptions and re-issues them automatically after a reconnect. That
/// is where "re-subscribe all active patterns on reconnect" comes from:
/// it is a property of the subscriber client, not something this adapter
/// has to reimplement.
pub struct RedisKvStore {
    client: Client,
    subscriber: SubscriberClient,
}

fn store_err(err: Error) -> RouterError {
    RouterError::StoreUnavailable {
        detail: err.to_string(),
    }
}

/// Backoff schedule for reconnect attempts: doubling from 100ms up to a
/// 5s cap, retried indefinitely.
fn reconnect_policy() -> ReconnectPolicy {
    ReconnectPolicy::new_exponential(0, 100, 5_000, 2)
}

impl RedisKvStore {
    pub async fn connect(endpoint: &str, password: Option<&str>) -> Result<Self, RouterError> {
        let mut config = Config::from_url(endpoint).map_err(store_err)?;
        if let Some(password) = password {
            config.password = Some(password.to_string());
        }

        let client = Builder::from_config(config.clone())
            .set_policy(reconnect_policy())
            .build()
            .map_err(store_err)?;
        client.init().await.map_err(store_err)?;
        client.on_reconnect(|_| {
            warn!("redis client reconnected");
            Ok(())
        });

        let subscriber: SubscriberClient = Builder::from_config(config)
            .set_policy(reconnect_policy())
            .build_subscriber_client()
            .map_err(store_err)?;
        subscriber.init().await.map_err(store_err)?;
        subscriber.manage_subscriptions();

        Ok(RedisKvStore { client, subscriber })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, RouterError> {
        let raw: Option<Vec<u8>> = self.client.get(key).await.map_err(store_err)?;
        Ok(raw.map(Bytes::from))
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        mode: SetMode,
    ) -> Result<bool, RouterError> {
        let expire = ttl.map(|d| Expiration::EX(d.as_secs().max(1) as i64));
        let set_opt = match mode {
            SetMode::IfAbsent => Some(SetOptions::NX),
            SetMode::Always => None,
        };
        let previous: Option<String> = self
            .client
            .set(key, value.to_vec(), expire, set_opt, false)
            .await
            .map_err(store_err)?;
        Ok(match mode {
            SetMode::Always => true,
            SetMode::IfAbsent => previous.is_some(),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, RouterError> {
        let deleted: i64 = self.client.del(key).await.map_err(store_err)?;
        Ok(deleted > 0)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RouterError> {
        let _: i64 = self
            .client
            .publish(topic, payload.to_vec())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<KvSubscription, RouterError> {
        self.subscriber.subscribe(topic).await.map_err(store_err)?;
        let topic_owned = topic.to_string();
        let stream = self
            .subscriber
            .message_rx()
            .into_stream()
            .filter_map(move |message| {
                let topic_owned = topic_owned.clone();
                async move {
                    if message.channel.to_string() != topic_owned {
                        return None;
                    }
                    message
                        .value
                        .as_bytes()
                        .map(|bytes| (topic_owned.clone(), Bytes::copy_from_slice(bytes)))
                }
            });
        Ok(Box::pin(stream))
    }
}
