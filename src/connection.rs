// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! One broker connection is shared by every publisher and consumer of a process.
//! The [`ConnectionManager`] hands out that connection, transparently redials it
//! when it is found closed, and runs a background health check that redials
//! between requests. Channels are never shared: each caller opens its own with
//! [`ConnectionManager::acquire_channel`].
//!
//! Redialing is serialized: when several callers observe a closed connection at
//! the same time, exactly one of them dials and the others receive the new
//! connection.

use crate::{config::BrokerConfig, errors::AmqpError};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Opens and inspects broker connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn dial(&self) -> Result<Self::Connection, AmqpError>;

    fn is_open(&self, connection: &Self::Connection) -> bool;

    async fn close(&self, connection: &Self::Connection) -> Result<(), AmqpError>;
}

/// Dials RabbitMQ through lapin.
pub struct AmqpDialer {
    uri: String,
    connection_name: String,
}

impl AmqpDialer {
    pub fn new(cfg: &BrokerConfig) -> AmqpDialer {
        AmqpDialer {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Connection = Connection;

    async fn dial(&self) -> Result<Connection, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if !self.connection_name.is_empty() {
            options =
                options.with_connection_name(LongString::from(self.connection_name.clone()));
        }

        match Connection::connect(&self.uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(conn)
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }

    fn is_open(&self, connection: &Connection) -> bool {
        connection.status().connected()
    }

    async fn close(&self, connection: &Connection) -> Result<(), AmqpError> {
        connection
            .close(200, "connection manager closed")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// Owner of the process-wide broker connection.
pub struct ConnectionManager<D: Dialer = AmqpDialer> {
    dialer: D,
    current: RwLock<Option<Arc<D::Connection>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionManager<AmqpDialer> {
    /// Connects to the broker described by `cfg`. A failure of the first dial is
    /// returned to the caller; later failures are retried on demand.
    pub async fn connect(cfg: &BrokerConfig) -> Result<Arc<Self>, AmqpError> {
        cfg.validate()?;
        Self::with_dialer(AmqpDialer::new(cfg), cfg.health_check_interval).await
    }

    /// Opens a fresh channel on the current connection, redialing first if needed.
    pub async fn acquire_channel(&self) -> Result<(Arc<Connection>, Channel), AmqpError> {
        let conn = self.connection().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!(channel_id = channel.id(), "channel created");
                Ok((conn, channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

impl<D: Dialer> ConnectionManager<D> {
    pub async fn with_dialer(
        dialer: D,
        health_check_interval: Duration,
    ) -> Result<Arc<Self>, AmqpError> {
        let conn = dialer.dial().await?;
        info!("amqp connection established");

        let manager = Arc::new(ConnectionManager {
            dialer,
            current: RwLock::new(Some(Arc::new(conn))),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(health_check(
            Arc::downgrade(&manager),
            manager.shutdown.clone(),
            health_check_interval,
        ));

        Ok(manager)
    }

    /// Returns the open connection, redialing when the current one is closed.
    pub async fn connection(&self) -> Result<Arc<D::Connection>, AmqpError> {
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }

        {
            let current = self.current.read().await;
            if let Some(conn) = current.as_ref().filter(|c| self.dialer.is_open(c)) {
                return Ok(conn.clone());
            }
        }

        // the write lock is held across the dial so concurrent callers wait for it
        let mut current = self.current.write().await;
        if self.shutdown.is_cancelled() {
            return Err(AmqpError::ManagerClosed);
        }
        if let Some(conn) = current.as_ref().filter(|c| self.dialer.is_open(c)) {
            return Ok(conn.clone());
        }

        warn!("amqp connection is closed, reconnecting");
        let conn = Arc::new(self.dialer.dial().await?);
        *current = Some(conn.clone());
        info!("amqp connection re-established");

        Ok(conn)
    }

    /// Stops the health check and closes the connection. Later calls return
    /// immediately and later acquisitions fail with [`AmqpError::ManagerClosed`].
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown.cancel();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut current = self.current.write().await;
        match current.take() {
            Some(conn) if self.dialer.is_open(&conn) => {
                self.dialer.close(&conn).await?;
                info!("amqp connection closed");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl<D: Dialer> Drop for ConnectionManager<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn health_check<D: Dialer>(
    manager: Weak<ConnectionManager<D>>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("stopping amqp connection health check");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };

        match manager.connection().await {
            Ok(_) | Err(AmqpError::ManagerClosed) => {}
            Err(err) => error!(error = err.to_string(), "amqp health check failed to reconnect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeConnection {
        id: usize,
        open: AtomicBool,
    }

    #[derive(Default)]
    struct FakeDialer {
        dials: AtomicUsize,
        closes: AtomicUsize,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl Dialer for Arc<FakeDialer> {
        type Connection = FakeConnection;

        async fn dial(&self) -> Result<FakeConnection, AmqpError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.refuse.load(Ordering::SeqCst) {
                return Err(AmqpError::ConnectionError("refused".to_owned()));
            }

            let id = self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                id,
                open: AtomicBool::new(true),
            })
        }

        fn is_open(&self, connection: &FakeConnection) -> bool {
            connection.open.load(Ordering::SeqCst)
        }

        async fn close(&self, connection: &FakeConnection) -> Result<(), AmqpError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            connection.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    const INTERVAL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_single_redial() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = ConnectionManager::with_dialer(dialer.clone(), INTERVAL)
            .await
            .unwrap();

        let first = manager.connection().await.unwrap();
        first.open.store(false, Ordering::SeqCst);

        let (a, b) = tokio::join!(manager.connection(), manager.connection());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id, 1);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_redials_a_dropped_connection() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = ConnectionManager::with_dialer(dialer.clone(), INTERVAL)
            .await
            .unwrap();

        manager
            .connection()
            .await
            .unwrap()
            .open
            .store(false, Ordering::SeqCst);

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        let current = manager.current.read().await;
        assert!(current.as_ref().is_some_and(|c| c.id == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_redial_is_reported_and_retried() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = ConnectionManager::with_dialer(dialer.clone(), INTERVAL)
            .await
            .unwrap();

        manager
            .connection()
            .await
            .unwrap()
            .open
            .store(false, Ordering::SeqCst);
        dialer.refuse.store(true, Ordering::SeqCst);

        assert!(matches!(
            manager.connection().await,
            Err(AmqpError::ConnectionError(_))
        ));

        dialer.refuse.store(false, Ordering::SeqCst);
        assert_eq!(manager.connection().await.unwrap().id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_rejects_later_acquisitions() {
        let dialer = Arc::new(FakeDialer::default());
        let manager = ConnectionManager::with_dialer(dialer.clone(), INTERVAL)
            .await
            .unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(dialer.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.connection().await.err(),
            Some(AmqpError::ManagerClosed)
        );

        // the stopped health check never dials again
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_dial_failure_is_returned() {
        let dialer = Arc::new(FakeDialer::default());
        dialer.refuse.store(true, Ordering::SeqCst);

        let result = ConnectionManager::with_dialer(dialer, INTERVAL).await;

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
    }
}
