//! A small STOMP 1.2 client shaped after the JMS object model: a
//! [`ConnectionFactory`] resolves a provider URL to a live [`Connection`],
//! connections hand out [`Session`]s, and sessions create [`Producer`]s and
//! [`Consumer`]s. Every handle follows create -> start -> use -> close.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod connection;
pub mod consumer;
pub mod failover;
pub mod frame;
pub mod session;

pub use connection::{Connection, ConnectionFactory, Credentials};
pub use consumer::{Consumer, ConsumerOptions, MessageListener};
pub use failover::{Endpoint, FailoverUrl};
pub use frame::{Command, Frame};
pub use session::{Producer, Session, SessionMode};

// guarded maps hold no invariant a panic could break
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
#[cfg(test)]
mod tests_utils;
