//! Connected client sessions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use keyward_auth::{Permissions, TimeWindows, UserClaims};
use keyward_core::{PublicKey, TrustResult};

use crate::limits::EffectiveLimits;
use crate::shadow::ShadowId;

/// Server-assigned connection identifier. Increases with connection order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ClientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cid:{}", self.0)
    }
}

/// Why the server closed a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Expired,
    Revoked,
    SignerRemoved,
    MaxConnectionsExceeded,
    AccountExpired,
    ClientClosed,
}

impl DisconnectReason {
    pub fn client_text(&self) -> &'static str {
        match self {
            DisconnectReason::Expired => "User Authentication Expired",
            DisconnectReason::Revoked => "User Authentication Revoked",
            DisconnectReason::SignerRemoved => "Authorization Violation",
            DisconnectReason::MaxConnectionsExceeded => "Maximum Connections Exceeded",
            DisconnectReason::AccountExpired => "Account Authentication Expired",
            DisconnectReason::ClientClosed => "Client Closed",
        }
    }
}

impl core::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.client_text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// What a session's owner receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Message(Message),
    Disconnected(DisconnectReason),
}

/// One subscription of a client and the shadows derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSub {
    pub subject: String,
    pub shadows: Vec<ShadowId>,
}

#[derive(Debug, Clone, Copy)]
struct ResponseGrant {
    remaining: Option<u64>,
    deadline: Option<DateTime<Utc>>,
}

pub struct ClientSession {
    id: ClientId,
    claims: UserClaims,
    signer: PublicKey,
    connected_at: DateTime<Utc>,
    limits: EffectiveLimits,
    permissions: Permissions,
    windows: TimeWindows,
    outbox: UnboundedSender<ClientEvent>,
    pub(crate) subs: BTreeMap<u64, ClientSub>,
    responses: Mutex<BTreeMap<String, ResponseGrant>>,
}

impl ClientSession {
    pub fn new(
        id: ClientId,
        claims: UserClaims,
        signer: PublicKey,
        account_limits: &EffectiveLimits,
        connected_at: DateTime<Utc>,
        outbox: UnboundedSender<ClientEvent>,
    ) -> TrustResult<Self> {
        let windows = TimeWindows::parse(&claims.data.limits.times, claims.data.limits.locale.as_deref())?;
        Ok(Self {
            id,
            limits: account_limits.for_user(&claims.data.limits),
            permissions: claims.data.permissions.clone().normalized(),
            signer,
            connected_at,
            windows,
            outbox,
            claims,
            subs: BTreeMap::new(),
            responses: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user(&self) -> &PublicKey {
        &self.claims.sub
    }

    pub fn claims(&self) -> &UserClaims {
        &self.claims
    }

    /// Key that signed the user claim (the account or one of its signing keys).
    pub fn signer(&self) -> &PublicKey {
        &self.signer
    }

    pub fn issued_at(&self) -> i64 {
        self.claims.iat
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn limits(&self) -> &EffectiveLimits {
        &self.limits
    }

    /// Recompute the user-capped limits after the account limits changed.
    pub(crate) fn apply_limits(&mut self, account_limits: &EffectiveLimits) {
        self.limits = account_limits.for_user(&self.claims.data.limits);
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (u64, &ClientSub)> {
        self.subs.iter().map(|(sid, s)| (*sid, s))
    }

    /// False once the connection side dropped its event receiver.
    pub fn is_connected(&self) -> bool {
        !self.outbox.is_closed()
    }

    /// Next instant at which the session must be re-checked: claim expiry or
    /// the end of the current time window, whichever is first.
    pub fn next_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let exp = self
            .claims
            .exp
            .filter(|e| *e > 0)
            .and_then(|e| Utc.timestamp_opt(e, 0).single());
        let window_end = self.windows.current_window_end(now);
        match (exp, window_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Is the session still allowed at `now`? `Some(reason)` if not.
    pub fn check_validity(&self, now: DateTime<Utc>) -> Option<DisconnectReason> {
        if keyward_auth::validation::check_time_bounds(&self.claims, now).is_err() || !self.windows.contains(now) {
            return Some(DisconnectReason::Expired);
        }
        None
    }

    pub(crate) fn send(&self, event: ClientEvent) -> bool {
        self.outbox.send(event).is_ok()
    }

    /// Deliver a message, recording a reply grant when the user may respond.
    pub(crate) fn deliver(&self, subject: &str, reply: Option<&str>, payload: &[u8], now: DateTime<Utc>) -> bool {
        if let (Some(reply), Some(resp)) = (reply, self.permissions.response) {
            let grant = ResponseGrant {
                remaining: u64::try_from(resp.max_msgs).ok(),
                deadline: (resp.expires_ms >= 0).then(|| now + Duration::milliseconds(resp.expires_ms)),
            };
            self.responses.lock().insert(reply.to_string(), grant);
        }
        self.send(ClientEvent::Message(Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload: payload.to_vec(),
        }))
    }

    /// May this session publish to `subject`? Consumes a reply grant if one is used.
    pub(crate) fn may_publish(&self, subject: &str, now: DateTime<Utc>) -> bool {
        if self.permissions.publish.allows(subject) {
            return true;
        }
        let mut responses = self.responses.lock();
        responses.retain(|_, g| g.deadline.is_none_or(|d| now <= d));
        let Some(grant) = responses.get_mut(subject) else {
            return false;
        };
        match grant.remaining.as_mut() {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    responses.remove(subject);
                }
                true
            }
            None => true,
        }
    }

    pub(crate) fn close(&self, reason: DisconnectReason) {
        let _ = self.send(ClientEvent::Disconnected(reason));
    }
}

impl core::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("user", self.user())
            .field("signer", &self.signer)
            .field("subs", &self.subs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_auth::{ResponsePermission, SubjectPermission, UserData};
    use keyward_core::{KeyKind, KeyPair};
    use tokio::sync::mpsc;

    fn session(
        id: u64,
        data: UserData,
        iat: i64,
    ) -> (ClientSession, mpsc::UnboundedReceiver<ClientEvent>) {
        let account = KeyPair::generate(KeyKind::Account);
        let user = KeyPair::generate(KeyKind::User);
        let mut claims = UserClaims::new(user.public_key(), data).issued_at(iat);
        claims.iss = account.public_key();
        let (tx, rx) = mpsc::unbounded_channel();
        let s = ClientSession::new(
            ClientId::new(id),
            claims,
            account.public_key(),
            &EffectiveLimits::default(),
            Utc::now(),
            tx,
        )
        .unwrap();
        (s, rx)
    }

    #[test]
    fn reply_grant_allows_limited_responses() {
        let mut data = UserData::default();
        data.permissions.publish = SubjectPermission::allow(["only.this"]);
        data.permissions.response = Some(ResponsePermission::default());
        let (s, mut rx) = session(1, data, 1);
        let now = Utc::now();

        assert!(!s.may_publish("_INBOX.x", now));
        assert!(s.deliver("svc", Some("_INBOX.x"), b"req", now));
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Message(_))));
        assert!(s.may_publish("_INBOX.x", now));
        // Default allowance is a single response.
        assert!(!s.may_publish("_INBOX.x", now));
    }

    #[test]
    fn reply_grant_expires() {
        let mut data = UserData::default();
        data.permissions.publish = SubjectPermission::allow(["none"]);
        data.permissions.response = Some(ResponsePermission { max_msgs: -1, expires_ms: 1000 });
        let (s, _rx) = session(1, data, 1);
        let now = Utc::now();
        s.deliver("svc", Some("reply.1"), b"", now);
        assert!(s.may_publish("reply.1", now));
        assert!(s.may_publish("reply.1", now));
        assert!(!s.may_publish("reply.1", now + Duration::seconds(2)));
    }

    #[test]
    fn deadline_is_earliest_of_expiry_and_window() {
        let (s, _rx) = session(1, UserData::default(), 1);
        assert_eq!(s.next_deadline(Utc::now()), None);

        let mut data = UserData::default();
        data.limits.times = vec![keyward_auth::TimeRange::new("00:00:00", "23:59:59")];
        let (mut s, _rx) = session(2, data, 1);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let window_end = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        assert_eq!(s.next_deadline(now), Some(window_end));
        s.claims.exp = Some(now.timestamp() + 60);
        assert_eq!(s.next_deadline(now), Some(now + Duration::seconds(60)));
    }

    #[test]
    fn close_reports_reason() {
        let (s, mut rx) = session(1, UserData::default(), 1);
        s.close(DisconnectReason::Revoked);
        assert_eq!(rx.try_recv(), Ok(ClientEvent::Disconnected(DisconnectReason::Revoked)));
        assert_eq!(DisconnectReason::Revoked.client_text(), "User Authentication Revoked");
    }
}
