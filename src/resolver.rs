//! Pluggable name resolution.
//!
//! A resolver answers one query type per call and reports through a
//! callback that fires exactly once. The [`CallbackCaller`] guard enforces
//! the "exactly once" contract: a query dropped before completion still
//! reports, with [`ResolveStatus::Unknown`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::host::{HostLookup, LookupResult};
use std::sync::Arc;

/// RRtype of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryType {
    #[default]
    A,
    Aaaa,
    Sshfp,
}

impl QueryType {
    pub fn rrtype(self) -> i64 {
        match self {
            QueryType::A => 1,
            QueryType::Aaaa => 28,
            QueryType::Sshfp => 44,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueryType::A => "A",
            QueryType::Aaaa => "AAAA",
            QueryType::Sshfp => "SSHFP",
        }
    }
}

/// Disposition of a resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Ok,
    NotResolved,
    TypeNotSupported,
    Unknown,
}

/// Whether the resolution path provides integrity end to end.
///
/// A secure zone resolved over a validating path yields `Authentic`;
/// everything else is `Insecure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    Authentic,
    Insecure,
}

/// Invoked exactly once per [`Resolver::resolve`]. When the status is not
/// [`ResolveStatus::Ok`] the result list is empty.
pub type Callback =
    Box<dyn FnOnce(ResolveStatus, Authenticity, Vec<String>) + Send>;

pub trait Resolver: Send + Sync {
    fn resolve(&self, name: String, qtype: QueryType, callback: Callback);

    /// Whether this resolver validates responses.
    fn is_validating(&self) -> bool;
}

/// Guard that guarantees the callback fires exactly once. Dropping an
/// uncalled guard reports `Unknown`/`Insecure`/empty.
pub struct CallbackCaller(Option<Callback>);

impl CallbackCaller {
    pub fn new(callback: Callback) -> CallbackCaller {
        CallbackCaller(Some(callback))
    }

    pub fn call(
        mut self,
        status: ResolveStatus,
        authenticity: Authenticity,
        results: Vec<String>,
    ) {
        if let Some(cb) = self.0.take() {
            cb(status, authenticity, results);
        }
    }
}

impl Drop for CallbackCaller {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb(ResolveStatus::Unknown, Authenticity::Insecure, Vec::new());
        }
    }
}

/// Resolver over the host stack's lookup primitive. Address records only;
/// the host cannot answer SSHFP, and provides no validation.
pub struct HostResolver {
    lookup: Arc<dyn HostLookup>,
}

impl HostResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> HostResolver {
        HostResolver { lookup }
    }
}

impl Resolver for HostResolver {
    fn resolve(&self, name: String, qtype: QueryType, callback: Callback) {
        let caller = CallbackCaller::new(callback);
        let want_ipv6 = match qtype {
            QueryType::A => false,
            QueryType::Aaaa => true,
            QueryType::Sshfp => {
                caller.call(
                    ResolveStatus::TypeNotSupported,
                    Authenticity::Insecure,
                    Vec::new(),
                );
                return;
            }
        };
        self.lookup.lookup(
            &name,
            want_ipv6,
            Box::new(move |result| match result {
                LookupResult::Addresses(addrs) => {
                    caller.call(ResolveStatus::Ok, Authenticity::Insecure, addrs)
                }
                LookupResult::NotResolved => caller.call(
                    ResolveStatus::NotResolved,
                    Authenticity::Insecure,
                    Vec::new(),
                ),
                // Let the guard report the failure.
                LookupResult::Failed => drop(caller),
            }),
        );
    }

    fn is_validating(&self) -> bool {
        false
    }
}
