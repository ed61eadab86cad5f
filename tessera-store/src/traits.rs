// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

/// Provider of serialized write transactions.
///
/// Beginning a transaction hands out a permit which has to be given back on commit or rollback.
/// Holding the permit is what entitles a caller to issue queries through the store; every engine
/// call holds exactly one for its whole duration.
pub trait Transaction {
    type Error: Error;

    type Permit;

    /// Waits until no other transaction is open and begins a new one.
    fn begin(&self) -> impl Future<Output = Result<Self::Permit, Self::Error>>;

    /// Discards every write issued since `begin` and releases the permit.
    fn rollback(&self, permit: Self::Permit) -> impl Future<Output = Result<(), Self::Error>>;

    /// Makes every write issued since `begin` visible and releases the permit.
    fn commit(&self, permit: Self::Permit) -> impl Future<Output = Result<(), Self::Error>>;
}
