//! Google Public DNS-over-HTTPS resolver.
//!
//! Issues `GET https://dns.google.com/resolve?name=<n>&type=<T>` through
//! the host URL loader and parses the JSON reply. The TLS transport to the
//! validating resolver is the authenticity boundary, so results are always
//! reported [`Authenticity::Authentic`].
//!
//! Each query owns itself: the pending state moves into the fetch
//! continuation, and the [`CallbackCaller`] guard inside it makes sure the
//! callback fires exactly once however the query ends.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::host::{FetchResult, UrlFetcher};
use crate::resolver::{
    Authenticity, Callback, CallbackCaller, QueryType, ResolveStatus, Resolver,
};

const GPDNS_URL: &str = "https://dns.google.com/resolve";

pub struct GpdnsResolver {
    fetcher: Arc<dyn UrlFetcher>,
}

impl GpdnsResolver {
    pub fn new(fetcher: Arc<dyn UrlFetcher>) -> GpdnsResolver {
        GpdnsResolver { fetcher }
    }
}

fn is_network_address(candidate: &str) -> bool {
    candidate.parse::<Ipv4Addr>().is_ok() || candidate.parse::<Ipv6Addr>().is_ok()
}

impl Resolver for GpdnsResolver {
    fn resolve(&self, name: String, qtype: QueryType, callback: Callback) {
        let caller = CallbackCaller::new(callback);

        // A literal address answers itself; no query goes out.
        if matches!(qtype, QueryType::A | QueryType::Aaaa) && is_network_address(&name)
        {
            caller.call(ResolveStatus::Ok, Authenticity::Authentic, vec![name]);
            return;
        }

        let url = format!("{GPDNS_URL}?name={name}&type={}", qtype.name());
        self.fetcher.get(
            &url,
            Box::new(move |result| process_response(caller, qtype, result)),
        );
    }

    fn is_validating(&self) -> bool {
        true
    }
}

fn process_response(caller: CallbackCaller, qtype: QueryType, result: FetchResult) {
    let FetchResult::Response { status, body } = result else {
        // Transport failure; the guard reports Unknown.
        return;
    };
    if status != 200 {
        debug!("gpdns: HTTP status {status}");
        return;
    }
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) else {
        debug!("gpdns: malformed response body");
        return;
    };

    let Some(answers) = json.get("Answer") else {
        // No answer section: the name does not exist.
        caller.call(ResolveStatus::NotResolved, Authenticity::Authentic, Vec::new());
        return;
    };
    let Some(answers) = answers.as_array() else {
        return;
    };

    let mut results = Vec::new();
    for answer in answers {
        let Some(rrtype) = answer.get("type").and_then(|t| t.as_i64()) else {
            // Malformed entry; the guard reports Unknown.
            return;
        };
        if rrtype != qtype.rrtype() {
            // Not the record we asked about (e.g. a CNAME in the chain).
            continue;
        }
        let Some(data) = answer.get("data").and_then(|d| d.as_str()) else {
            return;
        };
        results.push(data.to_string());
    }

    if results.is_empty() {
        // NODATA: answers exist but none of the requested RRtype.
        caller.call(ResolveStatus::NotResolved, Authenticity::Authentic, Vec::new());
        return;
    }

    caller.call(ResolveStatus::Ok, Authenticity::Authentic, results);
}
