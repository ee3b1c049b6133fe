//! Sends queries and responses and correlates incoming responses with their
//! originating queries.

use crate::{
    message::{ErrorMessage, Message, MessageBody, Query, Response},
    routing::node::NodeHandle,
    socket::Socket,
    transaction::{Origin, PendingTransaction, Sweep, TransactionSet},
    worker::IpVersion,
};
use rand::Rng;
use std::{io, net::SocketAddr, time::Duration};

pub(crate) struct Dispatcher {
    socket: Socket,
    transactions: TransactionSet,
}

impl Dispatcher {
    pub fn new<R: Rng>(socket: Socket, timeout: Duration, rng: &mut R) -> Self {
        Self {
            socket,
            transactions: TransactionSet::new(timeout, rng),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn ip_version(&self) -> IpVersion {
        self.socket.ip_version()
    }

    pub fn num_pending(&self) -> usize {
        self.transactions.len()
    }

    pub(crate) async fn recv(&mut self) -> io::Result<(Message, SocketAddr)> {
        self.socket.recv().await
    }

    /// Send a query to `target`. The transaction is registered before the
    /// datagram leaves so even an immediate response finds it.
    pub(crate) async fn send_query(&mut self, query: Query, target: NodeHandle, origin: Origin) {
        let id = self.transactions.next_id();
        let message = Message {
            transaction_id: id.to_bytes().to_vec(),
            body: MessageBody::Query(query),
        }
        .encode();

        self.transactions
            .insert(id, target, message.clone(), origin);

        log::trace!(
            "{}: sending query {id} to {:?}",
            self.ip_version(),
            target.addr
        );

        // Send failures are not fatal: the transaction simply times out and
        // the failure is accounted to the target node by the sweep.
        if let Err(error) = self.socket.send(&message, target.addr).await {
            log::debug!(
                "{}: failed to send query to {:?}: {error}",
                self.ip_version(),
                target.addr
            );
        }
    }

    pub(crate) async fn send_response(
        &mut self,
        transaction_id: Vec<u8>,
        response: Response,
        addr: SocketAddr,
    ) {
        self.send_body(transaction_id, MessageBody::Response(response), addr)
            .await
    }

    pub(crate) async fn send_error(
        &mut self,
        transaction_id: Vec<u8>,
        error: ErrorMessage,
        addr: SocketAddr,
    ) {
        self.send_body(transaction_id, MessageBody::Error(error), addr)
            .await
    }

    async fn send_body(&mut self, transaction_id: Vec<u8>, body: MessageBody, addr: SocketAddr) {
        let message = Message {
            transaction_id,
            body,
        }
        .encode();

        if let Err(error) = self.socket.send(&message, addr).await {
            log::debug!(
                "{}: failed to send reply to {addr:?}: {error}",
                self.ip_version()
            );
        }
    }

    /// Settle the transaction a response or error datagram belongs to.
    pub fn resolve(&mut self, raw_id: &[u8], from: SocketAddr) -> Option<PendingTransaction> {
        self.transactions.resolve(raw_id, from)
    }

    /// Resend timed-out queries with retry budget left and hand back the
    /// transactions that are now given up on.
    pub(crate) async fn sweep(&mut self) -> Vec<(NodeHandle, Origin)> {
        let Sweep { retries, expired } = self.transactions.sweep();

        for (id, target, message) in retries {
            log::trace!(
                "{}: retrying query {id} to {:?}",
                self.ip_version(),
                target.addr
            );

            if let Err(error) = self.socket.send(&message, target.addr).await {
                log::debug!(
                    "{}: failed to resend query to {:?}: {error}",
                    self.ip_version(),
                    target.addr
                );
            }
        }

        expired
    }
}
