//! The client instance: wires configuration, the facade, resolvers and
//! the bootstrap together, and marshals traffic between the embedder and
//! the worker thread.
//!
//! One instance exists per process. The embedder thread calls
//! [`handle_message`](MoshInstance::handle_message); exactly one worker
//! thread runs at a time, first the SSH bootstrap (in ssh mode), then the
//! Mosh transport. Every exit path tells the embedder with an `exit`
//! message.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use zeroize::Zeroizing;

use crate::agent::{AgentPort, AgentSocket, AGENT_SOCKET_NAME};
use crate::config::{Config, DnsResolverChoice};
use crate::gpdns::GpdnsResolver;
use crate::host::{
    BusMessage, EmbedderBus, HostLookup, KnownHosts, MainThread, MoshEntry,
    NetFactory, SshEngineFactory, UrlFetcher,
};
use crate::login::SshLogin;
use crate::posix::Posix;
use crate::resolver::{Authenticity, HostResolver, Resolver, ResolveStatus};
use crate::termio::{DevUrandom, ErrorLog, Keyboard, Terminal, WindowChange};

static INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Everything the embedder provides.
pub struct HostHooks {
    pub bus: Arc<dyn EmbedderBus>,
    pub net: Box<dyn NetFactory>,
    pub main: Arc<dyn MainThread>,
    pub lookup: Arc<dyn HostLookup>,
    pub fetcher: Arc<dyn UrlFetcher>,
    pub engines: Arc<dyn SshEngineFactory>,
    pub mosh: MoshEntry,
}

/// Inbound embedder message, already decoded from the wire dictionary.
#[derive(Debug)]
pub enum InMessage {
    Keyboard(String),
    /// Packed `width << 16 | height`.
    WindowChange(u32),
    SshKey(Option<String>),
    KnownHosts(Option<KnownHosts>),
    SshAgent(Vec<u8>),
}

pub struct MoshInstance {
    weak_self: Weak<MoshInstance>,
    config: Config,
    posix: Arc<Posix>,
    bus: Arc<dyn EmbedderBus>,
    main: Arc<dyn MainThread>,
    resolver: Arc<dyn Resolver>,
    engines: Arc<dyn SshEngineFactory>,
    keyboard: Keyboard,
    window: WindowChange,
    agent_port: Arc<AgentPort>,
    login: Mutex<SshLogin>,
    mosh_entry: Mutex<Option<MoshEntry>>,
    // (addr, port) for the Mosh argv.
    mosh_args: Mutex<Option<(String, String)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MoshInstance {
    /// Builds the instance: parses attributes, constructs the facade with
    /// the keyboard/terminal/stderr/window-change endpoints, registers
    /// `/dev/urandom` and the agent socket, and picks the resolver.
    pub fn new(
        attrs: &[(String, String)],
        hooks: HostHooks,
    ) -> Result<Arc<MoshInstance>> {
        let config =
            Config::parse(attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;

        assert_eq!(
            INSTANCES.fetch_add(1, Ordering::SeqCst),
            0,
            "one instance per process"
        );

        let keyboard = Keyboard::new();
        let window = WindowChange::new();
        let posix = Arc::new(Posix::new(
            hooks.net,
            hooks.main.clone(),
            Box::new(keyboard.clone()),
            Box::new(Terminal::new(hooks.bus.clone())),
            Box::new(ErrorLog::new(hooks.bus.clone())),
            Some(Box::new(window.clone())),
        ));
        posix.register_file("/dev/urandom", Box::new(DevUrandom::endpoint));

        let agent_port = Arc::new(AgentPort::default());
        let agent_bus = hooks.bus.clone();
        let agent_port2 = agent_port.clone();
        posix.register_local_stream(Box::new(move || {
            Box::new(AgentSocket::new(agent_bus.clone(), agent_port2.clone()))
        }));

        let resolver: Arc<dyn Resolver> = match config.dns_resolver {
            DnsResolverChoice::GooglePublicDns => {
                Arc::new(GpdnsResolver::new(hooks.fetcher.clone()))
            }
            DnsResolverChoice::HostNative => {
                Arc::new(HostResolver::new(hooks.lookup.clone()))
            }
        };

        if !config.ssh_mode && !config.key.is_empty() {
            std::env::set_var("MOSH_KEY", config.key.as_str());
        }
        if !config.mosh_escape_key.is_empty() {
            std::env::set_var("MOSH_ESCAPE_KEY", &config.mosh_escape_key);
        }

        let login = SshLogin {
            use_agent: config.use_agent,
            trust_sshfp: config.trust_sshfp,
            host: config.addr.clone(),
            qtype: config.family,
            port: config.port.clone(),
            user: config.user.clone(),
            server_command: config.server_command.clone(),
            remote_command: config.remote_command.clone(),
            ..Default::default()
        };

        Ok(Arc::new_cyclic(|weak_self| MoshInstance {
            weak_self: weak_self.clone(),
            config,
            posix,
            bus: hooks.bus,
            main: hooks.main,
            resolver,
            engines: hooks.engines,
            keyboard,
            window,
            agent_port,
            login: Mutex::new(login),
            mosh_entry: Mutex::new(Some(hooks.mosh)),
            mosh_args: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }

    /// An owning handle to hand into callbacks and threads. A live `&self`
    /// implies a live strong count.
    fn strong(&self) -> Arc<MoshInstance> {
        self.weak_self.upgrade().expect("instance is alive")
    }

    /// Kicks off the session. In ssh mode the key/known-hosts exchange
    /// with the embedder leads to the bootstrap; in direct mode the
    /// resolver callback launches Mosh.
    pub fn start(&self) {
        if self.config.ssh_mode {
            // handle_message() continues from the ssh_key reply.
            self.bus.post(BusMessage::GetSshKey);
        } else {
            let this = self.strong();
            self.resolver.resolve(
                self.config.addr.clone(),
                self.config.family,
                Box::new(move |status, authenticity, results| {
                    this.launch_manual(status, authenticity, results);
                }),
            );
        }
    }

    /// Handles one inbound embedder message.
    pub fn handle_message(&self, msg: InMessage) {
        match msg {
            InMessage::Keyboard(input) => self.keyboard.handle_input(&input),
            InMessage::WindowChange(packed) => self
                .window
                .update((packed >> 16) as u16, (packed & 0xffff) as u16),
            InMessage::SshKey(key) => {
                if let Some(key) = key {
                    self.login.lock().unwrap().key = Zeroizing::new(key);
                }
                // Continue the startup conversation.
                self.bus.post(BusMessage::SyncGetKnownHosts);
            }
            InMessage::KnownHosts(known_hosts) => {
                if let Some(kh) = known_hosts {
                    self.login.lock().unwrap().known_hosts = kh;
                }
                // get_ssh_key already came back, so everything needed for
                // the login is here.
                self.launch_ssh_login();
            }
            InMessage::SshAgent(bytes) => self.agent_port.deliver(&bytes),
        }
    }

    /// Decodes the embedder's wire dictionary into an [`InMessage`].
    pub fn handle_message_dict(&self, dict: &serde_json::Value) {
        let msg = if let Some(s) = dict.get("keyboard").and_then(|v| v.as_str()) {
            InMessage::Keyboard(s.into())
        } else if let Some(n) = dict.get("window_change").and_then(|v| v.as_u64()) {
            InMessage::WindowChange(n as u32)
        } else if let Some(key) = dict.get("ssh_key") {
            InMessage::SshKey(key.as_str().map(String::from))
        } else if let Some(kh) = dict.get("known_hosts") {
            InMessage::KnownHosts(serde_json::from_value(kh.clone()).ok())
        } else if let Some(arr) = dict.get("ssh_agent").and_then(|v| v.as_array()) {
            InMessage::SshAgent(
                arr.iter()
                    .filter_map(|v| v.as_u64())
                    .map(|b| b as u8)
                    .collect(),
            )
        } else {
            warn!("got a message of an unexpected type");
            return;
        };
        self.handle_message(msg);
    }

    /// Current window geometry, `(width, height)`.
    pub fn window_size(&self) -> (u16, u16) {
        self.window.size()
    }

    fn error(&self, msg: &str) {
        self.bus.post(BusMessage::Error(msg.into()));
    }

    /// Direct-mode continuation of the resolver query.
    fn launch_manual(
        &self,
        status: ResolveStatus,
        authenticity: Authenticity,
        results: Vec<String>,
    ) {
        if self.resolver.is_validating() {
            match authenticity {
                Authenticity::Authentic => self
                    .bus
                    .post(BusMessage::Display("Authenticated DNS lookup.\r\n".into())),
                Authenticity::Insecure => self.bus.post(BusMessage::Display(
                    "Could NOT authenticate DNS lookup.\r\n".into(),
                )),
            }
        }
        match status {
            ResolveStatus::Ok => {}
            ResolveStatus::NotResolved => {
                self.error(
                    "Could not resolve the hostname. \
                     Check the spelling and the address family.",
                );
                self.bus.post(BusMessage::Exit);
                return;
            }
            other => {
                self.error(&format!(
                    "Name resolution failed with unexpected error code: {other:?}"
                ));
                self.bus.post(BusMessage::Exit);
                return;
            }
        }
        let Some(address) = results.into_iter().next() else {
            self.error("There were no addresses.");
            self.bus.post(BusMessage::Exit);
            return;
        };
        // Only the first address is used.
        *self.mosh_args.lock().unwrap() = Some((address, self.config.port.clone()));
        self.launch_mosh();
    }

    /// Spawns the bootstrap on the worker thread.
    fn launch_ssh_login(&self) {
        // Points the engine's agent support at the named local socket.
        std::env::set_var("SSH_AUTH_SOCK", AGENT_SOCKET_NAME);

        // The worker slot is held across the spawn so the new thread's own
        // hand-off to launch_mosh() cannot observe it half-set.
        let mut worker = self.worker.lock().unwrap();
        let this = self.strong();
        let handle = std::thread::spawn(move || {
            let outcome = {
                let mut login = this.login.lock().unwrap();
                login.start(&this.posix, this.resolver.as_ref(), this.engines.as_ref())
            };
            match outcome {
                Err(e) => {
                    debug!("ssh login failed: {e:?}");
                    this.error("SSH Login failed.");
                    this.bus.post(BusMessage::Exit);
                }
                Ok(()) => {
                    {
                        let login = this.login.lock().unwrap();
                        *this.mosh_args.lock().unwrap() = Some((
                            login.mosh_addr().to_string(),
                            login.mosh_port().to_string(),
                        ));
                        std::env::set_var("MOSH_KEY", login.mosh_key());
                        // Persist whatever fingerprints the login added.
                        this.bus.post(BusMessage::SyncSetKnownHosts(
                            login.known_hosts().clone(),
                        ));
                    }
                    let this2 = this.clone();
                    this.main.post(Box::new(move || this2.launch_mosh()));
                }
            }
        });
        *worker = Some(handle);
    }

    /// Hands the session over to the Mosh transport on a fresh worker
    /// thread. The bootstrap thread, if any, is collected first.
    fn launch_mosh(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.take() {
            // When the embedder runs main-thread tasks inline this can be
            // the bootstrap thread itself; it needs no collecting then.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        let Some((addr, port)) = self.mosh_args.lock().unwrap().clone() else {
            self.error("No address to connect to.");
            self.bus.post(BusMessage::Exit);
            return;
        };
        let Some(entry) = self.mosh_entry.lock().unwrap().take() else {
            warn!("mosh entry already consumed");
            return;
        };

        let this = self.strong();
        let posix = self.posix.clone();
        let handle = std::thread::spawn(move || {
            std::env::set_var("TERM", "xterm-256color");
            if std::env::var_os("LANG").is_none() {
                // The embedder scrubs the environment on most platforms,
                // and wide character support needs a UTF-8 locale.
                std::env::set_var("LANG", "C.UTF-8");
            }
            debug!("handing off to the mosh transport");
            entry(posix, vec!["mosh-client".into(), addr, port]);
            debug!("mosh transport returned");
            this.bus.post(BusMessage::Exit);
        });
        *worker = Some(handle);
    }
}

impl Drop for MoshInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        INSTANCES.fetch_sub(1, Ordering::SeqCst);
    }
}
