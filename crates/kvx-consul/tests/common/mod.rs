//! In-process fake Consul agent for integration tests.
//!
//! Implements the subset of the HTTP API the store uses: KV reads (plain,
//! recursive and blocking), KV writes with `cas`/`acquire`/`release`, KV
//! deletes, and session create/renew/destroy with TTL expiry.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kvx_consul::{ConsulConfig, ConsulStore};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// How long a blocking query parks when nothing changed.
const BLOCKING_DELAY: Duration = Duration::from_millis(100);

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u64,
    create_index: u64,
    modify_index: u64,
    lock_index: u64,
    session: Option<String>,
}

#[derive(Debug)]
struct Session {
    behavior: String,
    ttl: Option<Duration>,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct State {
    index: u64,
    next_session: u64,
    kv: BTreeMap<String, Entry>,
    sessions: HashMap<String, Session>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            index: 1,
            next_session: 1,
            kv: BTreeMap::new(),
            sessions: HashMap::new(),
        }
    }
}

fn boolean(value: bool) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(if value { "true" } else { "false" })
}

fn parse_ttl(ttl: &str) -> Option<Duration> {
    if let Some(ms) = ttl.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = ttl.strip_suffix('s') {
        return secs.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    None
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    /// Invalidate every session whose TTL elapsed without renewal.
    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.invalidate(&id);
        }
    }

    fn invalidate(&mut self, id: &str) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        let index = self.bump();
        let held: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, e)| e.session.as_deref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in held {
            if session.behavior == "delete" {
                self.kv.remove(&key);
            } else if let Some(entry) = self.kv.get_mut(&key) {
                entry.session = None;
                entry.modify_index = index;
            }
        }
        true
    }

    fn entry_json(key: &str, entry: &Entry) -> Value {
        let value = if entry.value.is_empty() {
            Value::Null
        } else {
            Value::String(BASE64.encode(&entry.value))
        };
        json!({
            "Key": key,
            "Value": value,
            "Flags": entry.flags,
            "CreateIndex": entry.create_index,
            "ModifyIndex": entry.modify_index,
            "LockIndex": entry.lock_index,
            "Session": entry.session,
        })
    }

    fn kv_get(&self, key: &str, query: &HashMap<String, String>) -> ResponseTemplate {
        let entries: Vec<Value> = if query.contains_key("recurse") {
            self.kv
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, e)| Self::entry_json(k, e))
                .collect()
        } else {
            self.kv
                .get(key)
                .map(|e| Self::entry_json(key, e))
                .into_iter()
                .collect()
        };

        let mut template = if entries.is_empty() {
            ResponseTemplate::new(404)
        } else {
            ResponseTemplate::new(200).set_body_json(entries)
        };
        template = template.insert_header("X-Consul-Index", self.index.to_string());

        let wait_index = query.get("index").and_then(|i| i.parse::<u64>().ok());
        if wait_index.is_some_and(|i| i >= self.index) {
            template = template.set_delay(BLOCKING_DELAY);
        }
        template
    }

    fn kv_put(&mut self, key: &str, query: &HashMap<String, String>, body: &[u8]) -> ResponseTemplate {
        let flags = query
            .get("flags")
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);

        if let Some(cas) = query.get("cas").and_then(|c| c.parse::<u64>().ok()) {
            let current = self.kv.get(key).map(|e| e.modify_index);
            let matches = match current {
                None => cas == 0,
                Some(index) => cas != 0 && cas == index,
            };
            if !matches {
                return boolean(false);
            }
        }

        if let Some(session) = query.get("acquire") {
            if !self.sessions.contains_key(session) {
                return ResponseTemplate::new(500)
                    .set_body_string(format!("invalid session \"{}\"", session));
            }
            let holder = self.kv.get(key).and_then(|e| e.session.clone());
            if holder.as_ref().is_some_and(|h| h != session) {
                return boolean(false);
            }
            let index = self.bump();
            let entry = self.kv.entry(key.to_string()).or_insert_with(|| Entry {
                value: Vec::new(),
                flags: 0,
                create_index: index,
                modify_index: index,
                lock_index: 0,
                session: None,
            });
            if entry.session.as_deref() != Some(session.as_str()) {
                entry.lock_index += 1;
                entry.session = Some(session.clone());
            }
            entry.value = body.to_vec();
            entry.flags = flags;
            entry.modify_index = index;
            return boolean(true);
        }

        if let Some(session) = query.get("release") {
            let holder = self.kv.get(key).and_then(|e| e.session.clone());
            if holder.as_deref() != Some(session.as_str()) {
                return boolean(false);
            }
            let index = self.bump();
            if let Some(entry) = self.kv.get_mut(key) {
                entry.session = None;
                entry.value = body.to_vec();
                entry.flags = flags;
                entry.modify_index = index;
            }
            return boolean(true);
        }

        let index = self.bump();
        let entry = self.kv.entry(key.to_string()).or_insert_with(|| Entry {
            value: Vec::new(),
            flags: 0,
            create_index: index,
            modify_index: index,
            lock_index: 0,
            session: None,
        });
        entry.value = body.to_vec();
        entry.flags = flags;
        entry.modify_index = index;
        boolean(true)
    }

    fn kv_delete(&mut self, key: &str, query: &HashMap<String, String>) -> ResponseTemplate {
        if let Some(cas) = query.get("cas").and_then(|c| c.parse::<u64>().ok()) {
            if self.kv.get(key).map(|e| e.modify_index) != Some(cas) {
                return boolean(false);
            }
        }
        if query.contains_key("recurse") {
            self.kv.retain(|k, _| !k.starts_with(key));
        } else {
            self.kv.remove(key);
        }
        self.bump();
        boolean(true)
    }

    fn session_create(&mut self, body: &[u8]) -> ResponseTemplate {
        let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let ttl = request["TTL"].as_str().and_then(parse_ttl);
        let behavior = request["Behavior"]
            .as_str()
            .unwrap_or("release")
            .to_string();

        let id = format!("session-{}", self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            id.clone(),
            Session {
                behavior,
                ttl,
                deadline: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.bump();
        ResponseTemplate::new(200).set_body_json(json!({ "ID": id }))
    }

    fn session_renew(&mut self, id: &str) -> ResponseTemplate {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.deadline = session.ttl.map(|ttl| Instant::now() + ttl);
                ResponseTemplate::new(200).set_body_json(json!([{ "ID": id }]))
            }
            None => ResponseTemplate::new(404)
                .set_body_string(format!("Session id '{}' not found", id)),
        }
    }
}

struct Agent {
    state: Arc<Mutex<State>>,
}

impl Respond for Agent {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut state = self.state.lock().unwrap();
        state.sweep();

        let path = urlencoding::decode(request.url.path())
            .map(|p| p.into_owned())
            .unwrap_or_default();
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();

        if let Some(key) = path.strip_prefix("/v1/kv/") {
            return match request.method.as_str() {
                "GET" => state.kv_get(key, &query),
                "PUT" => state.kv_put(key, &query, &request.body),
                "DELETE" => state.kv_delete(key, &query),
                _ => ResponseTemplate::new(405),
            };
        }
        if path == "/v1/session/create" {
            return state.session_create(&request.body);
        }
        if let Some(id) = path.strip_prefix("/v1/session/renew/") {
            return state.session_renew(id);
        }
        if let Some(id) = path.strip_prefix("/v1/session/destroy/") {
            state.invalidate(id);
            return boolean(true);
        }
        ResponseTemplate::new(404).set_body_string("unknown endpoint")
    }
}

/// A running fake agent.
pub struct FakeConsul {
    server: MockServer,
    state: Arc<Mutex<State>>,
}

impl FakeConsul {
    pub async fn start() -> Self {
        init_tracing();
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(State::default()));
        Mock::given(any())
            .respond_with(Agent {
                state: state.clone(),
            })
            .mount(&server)
            .await;
        Self { server, state }
    }

    pub fn config(&self) -> ConsulConfig {
        ConsulConfig::with_address(self.server.uri())
    }

    /// A new store (own connection pool) against this agent.
    pub fn store(&self) -> ConsulStore {
        ConsulStore::new(&self.config()).unwrap()
    }

    /// Session currently holding `key` (backend form).
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.sweep();
        state.kv.get(key).and_then(|e| e.session.clone())
    }

    pub fn flags(&self, key: &str) -> Option<u64> {
        self.state.lock().unwrap().kv.get(key).map(|e| e.flags)
    }

    pub fn session_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.sweep();
        state.sessions.len()
    }

    /// Destroy a session behind the client's back.
    pub fn destroy_session(&self, id: &str) -> bool {
        self.state.lock().unwrap().invalidate(id)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().kv.contains_key(key)
    }
}
