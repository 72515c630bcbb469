//! pxe-manager CLI - reserve, kickstart and release QA hosts and addresses.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pxe_manager::boot::cobbler::Cobbler;
use pxe_manager::probe::ssh::SshShell;
use pxe_manager::probe::ShellProbe;
use pxe_manager::reservation::ReservationEvent;
use pxe_manager::resources::Resource;
use pxe_manager::store::eve::{self, EveStore};
use pxe_manager::store::memory::MemoryStore;
use pxe_manager::store::ResourceStore;
use pxe_manager::tags::{parse_pair, TagValue, Tags};
use pxe_manager::{
    AddressPool, AddressResource, HostResource, HostState, ManagerConfig, ReservationCoordinator,
    ReservationRequest,
};

/// pxe-manager - bare metal reservation and network-boot provisioning.
#[derive(Parser)]
#[command(name = "pxe-manager")]
#[command(about = "Reserve, kickstart and release QA hosts and IP addresses")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "PXE_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Resource datastore endpoint (overrides the config file).
    #[arg(long, env = "PXE_STORE_ENDPOINT")]
    store_endpoint: Option<String>,

    /// Resource datastore user.
    #[arg(long, env = "PXE_STORE_USERNAME")]
    store_username: Option<String>,

    /// Resource datastore password.
    #[arg(long, env = "PXE_STORE_PASSWORD", hide_env_values = true)]
    store_password: Option<String>,

    /// Cobbler XML-RPC endpoint.
    #[arg(long, env = "COBBLER_URL")]
    cobbler_url: Option<String>,

    /// Cobbler user.
    #[arg(long, env = "COBBLER_USERNAME")]
    cobbler_username: Option<String>,

    /// Cobbler password.
    #[arg(long, env = "COBBLER_PASSWORD", hide_env_values = true)]
    cobbler_password: Option<String>,

    /// SSH private key used by the readiness probe.
    #[arg(long, env = "PXE_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Use JSON files in this directory instead of the datastore
    /// (`machines.json`, `public-addresses.json`, `private-addresses.json`).
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reserve hosts, kickstart them and wait until they are verified.
    Reserve {
        /// Requester identity.
        #[arg(long)]
        owner: String,

        /// Job the hosts are reserved for.
        #[arg(long)]
        job_id: String,

        /// Number of hosts.
        #[arg(long, default_value = "1")]
        count: usize,

        /// Distro alias or boot profile name.
        #[arg(long, default_value = "centos7")]
        distro: String,

        /// Required capability (e.g. `memory=16GiB`, `cores=8`); repeatable.
        #[arg(long = "tag", value_parser = parse_pair)]
        tags: Vec<(String, TagValue)>,

        /// Give up and release everything after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Release hosts by job or by hostname.
    Free {
        /// Release every host reserved for this job.
        #[arg(long, required_unless_present = "host", conflicts_with = "host")]
        job_id: Option<String>,

        /// Release a single host, whatever its state.
        #[arg(long)]
        host: Option<String>,
    },

    /// Reserve IP addresses.
    ReserveIp {
        /// Requester identity.
        #[arg(long)]
        owner: String,

        /// Number of addresses.
        #[arg(long, default_value = "1")]
        count: usize,

        /// Use the private address pool.
        #[arg(long, default_value = "false")]
        private: bool,

        /// Required capability; repeatable.
        #[arg(long = "tag", value_parser = parse_pair)]
        tags: Vec<(String, TagValue)>,
    },

    /// Release IP addresses by owner or by address.
    ReleaseIp {
        /// Release every address held by this owner.
        #[arg(long, required_unless_present = "address", conflicts_with = "address")]
        owner: Option<String>,

        /// Release a single address.
        #[arg(long)]
        address: Option<String>,

        /// Use the private address pool.
        #[arg(long, default_value = "false")]
        private: bool,
    },

    /// List resources in a collection.
    List {
        /// Collection to list.
        #[arg(value_enum, default_value = "hosts")]
        collection: Collection,

        /// Only hosts in this state (idle, pxe, in_use, pxe_failed, needs_repair).
        #[arg(long)]
        state: Option<String>,
    },

    /// Add a resource to a collection.
    Create {
        /// Collection to add to.
        #[arg(value_enum)]
        collection: Collection,

        /// Hostname or address.
        key: String,

        /// Capability tag; repeatable.
        #[arg(long = "tag", value_parser = parse_pair)]
        tags: Vec<(String, TagValue)>,
    },

    /// Remove a resource from a collection.
    Delete {
        /// Collection to remove from.
        #[arg(value_enum)]
        collection: Collection,

        /// Hostname or address.
        key: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Collection {
    Hosts,
    PublicAddresses,
    PrivateAddresses,
}

/// JSON-file backed stores, written back when the command finishes.
struct Inventory {
    dir: PathBuf,
    hosts: Arc<MemoryStore<HostResource>>,
    public: Arc<MemoryStore<AddressResource>>,
    private: Arc<MemoryStore<AddressResource>>,
}

impl Inventory {
    async fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            dir: dir.to_path_buf(),
            hosts: load_collection(dir, eve::MACHINES).await?,
            public: load_collection(dir, eve::PUBLIC_ADDRESSES).await?,
            private: load_collection(dir, eve::PRIVATE_ADDRESSES).await?,
        })
    }

    async fn save(&self) -> Result<()> {
        self.hosts
            .save_json_file(&collection_path(&self.dir, eve::MACHINES))
            .await?;
        self.public
            .save_json_file(&collection_path(&self.dir, eve::PUBLIC_ADDRESSES))
            .await?;
        self.private
            .save_json_file(&collection_path(&self.dir, eve::PRIVATE_ADDRESSES))
            .await?;
        Ok(())
    }
}

fn collection_path(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{collection}.json"))
}

async fn load_collection<R: Resource>(dir: &Path, collection: &str) -> Result<Arc<MemoryStore<R>>> {
    let path = collection_path(dir, collection);
    if !path.exists() {
        return Ok(Arc::new(MemoryStore::default()));
    }
    let store = MemoryStore::from_json_file(&path)
        .await
        .with_context(|| format!("Failed to load inventory {}", path.display()))?;
    Ok(Arc::new(store))
}

/// The three collections, wherever they live.
struct Stores {
    hosts: Arc<dyn ResourceStore<HostResource>>,
    public: Arc<dyn ResourceStore<AddressResource>>,
    private: Arc<dyn ResourceStore<AddressResource>>,
    inventory: Option<Inventory>,
}

impl Stores {
    async fn open(config: &ManagerConfig, inventory: Option<&Path>) -> Result<Self> {
        if let Some(dir) = inventory {
            let inventory = Inventory::load(dir).await?;
            return Ok(Self {
                hosts: inventory.hosts.clone(),
                public: inventory.public.clone(),
                private: inventory.private.clone(),
                inventory: Some(inventory),
            });
        }

        Ok(Self {
            hosts: Arc::new(EveStore::machines(&config.store).context("Failed to create datastore client")?),
            public: Arc::new(EveStore::public_addresses(&config.store)?),
            private: Arc::new(EveStore::private_addresses(&config.store)?),
            inventory: None,
        })
    }

    fn addresses(&self, private: bool) -> AddressPool {
        if private {
            AddressPool::new(eve::PRIVATE_ADDRESSES, self.private.clone())
        } else {
            AddressPool::new(eve::PUBLIC_ADDRESSES, self.public.clone())
        }
    }
}

fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config = ManagerConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let overrides = [
        (&cli.store_endpoint, &mut config.store.endpoint),
        (&cli.store_username, &mut config.store.username),
        (&cli.store_password, &mut config.store.password),
        (&cli.cobbler_url, &mut config.cobbler.url),
        (&cli.cobbler_username, &mut config.cobbler.username),
        (&cli.cobbler_password, &mut config.cobbler.password),
    ];
    for (value, field) in overrides {
        if let Some(value) = value {
            field.clone_from(value);
        }
    }
    if let Some(key) = &cli.ssh_key {
        config.ssh.key_path = Some(key.clone());
    }

    Ok(config)
}

fn coordinator(config: &ManagerConfig, stores: &Stores) -> Result<ReservationCoordinator> {
    let boot = Cobbler::new(&config.cobbler).context("Failed to create Cobbler client")?;
    let probe = ShellProbe::new(SshShell::new(&config.ssh), &config.readiness);
    Ok(ReservationCoordinator::new(
        stores.hosts.clone(),
        Arc::new(boot),
        Arc::new(probe),
        config,
    ))
}

/// Cancel `cancel` on Ctrl-C or when `deadline` passes.
fn cancel_on_interrupt(cancel: CancellationToken, deadline: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, releasing claimed hosts"),
            () = deadline => warn!("Deadline reached, releasing claimed hosts"),
            () = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
}

fn format_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[allow(clippy::too_many_lines)]
async fn run(command: Commands, config: &ManagerConfig, stores: &Stores) -> Result<()> {
    match command {
        Commands::Reserve {
            owner,
            job_id,
            count,
            distro,
            tags,
            deadline_secs,
        } => {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let coordinator = coordinator(config, stores)?.with_events(tx);
            let request = ReservationRequest::new(owner, job_id.clone(), count, distro)
                .with_tags(tags.into_iter().collect());

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone(), deadline_secs.map(Duration::from_secs));

            let reserved = coordinator.reserve(&request, &cancel).await;
            cancel.cancel();
            drop(coordinator);

            while let Some(event) = rx.recv().await {
                if let ReservationEvent::ReplacementRequested { failed, .. } = event {
                    println!("🔁 {failed} failed verification and was replaced");
                }
            }

            let hosts = reserved.with_context(|| format!("Failed to reserve hosts for {job_id}"))?;
            println!("\n✅ Reserved {} host(s) for {job_id}", hosts.len());
            for host in hosts {
                println!("  {host}");
            }
        }

        Commands::Free { job_id, host } => {
            let coordinator = coordinator(config, stores)?;
            if let Some(host) = host {
                let released = coordinator.release_host(&host).await?;
                if released == 0 {
                    println!("⏭️  {host} was already idle");
                } else {
                    println!("✅ Released {host}");
                }
            } else if let Some(job_id) = job_id {
                let released = coordinator.release_job(&job_id).await?;
                println!("✅ Released {released} host(s) for {job_id}");
            }
        }

        Commands::ReserveIp {
            owner,
            count,
            private,
            tags,
        } => {
            let pool = stores.addresses(private);
            let tags: Tags = tags.into_iter().collect();
            let addresses = pool
                .reserve(&owner, count, &tags)
                .await
                .with_context(|| format!("Failed to reserve addresses from {}", pool.name()))?;
            println!("\n✅ Reserved {} address(es) for {owner}", addresses.len());
            for address in addresses {
                println!("  {address}");
            }
        }

        Commands::ReleaseIp {
            owner,
            address,
            private,
        } => {
            let pool = stores.addresses(private);
            if let Some(address) = address {
                let released = pool.release_address(&address).await?;
                println!("✅ Released {released} address(es)");
            } else if let Some(owner) = owner {
                let released = pool.release_owner(&owner).await?;
                println!("✅ Released {released} address(es) held by {owner}");
            }
        }

        Commands::List { collection, state } => match collection {
            Collection::Hosts => {
                let mut hosts = match &state {
                    Some(state) => stores.hosts.find("state", state).await?,
                    None => stores.hosts.list().await?,
                };
                hosts.sort_by(|a, b| a.resource.hostname.cmp(&b.resource.hostname));
                println!(
                    "\n{:<28} {:<13} {:<12} {:<16} TAGS",
                    "HOSTNAME", "STATE", "OWNER", "JOB"
                );
                println!("{}", "-".repeat(90));
                for record in hosts {
                    let host = record.resource;
                    println!(
                        "{:<28} {:<13} {:<12} {:<16} {}",
                        host.hostname,
                        host.state,
                        host.owner,
                        host.job_id,
                        format_tags(&host.tags)
                    );
                }
            }
            Collection::PublicAddresses | Collection::PrivateAddresses => {
                let store = if matches!(collection, Collection::PrivateAddresses) {
                    &stores.private
                } else {
                    &stores.public
                };
                let mut addresses = store.list().await?;
                addresses.sort_by(|a, b| a.resource.address.cmp(&b.resource.address));
                println!("\n{:<18} {:<16} TAGS", "ADDRESS", "OWNER");
                println!("{}", "-".repeat(60));
                for record in addresses {
                    let address = record.resource;
                    println!(
                        "{:<18} {:<16} {}",
                        address.address,
                        address.owner,
                        format_tags(&address.tags)
                    );
                }
            }
        },

        Commands::Create {
            collection,
            key,
            tags,
        } => {
            let tags: Tags = tags.into_iter().collect();
            match collection {
                Collection::Hosts => {
                    stores
                        .hosts
                        .create(&HostResource::new(&key).with_tags(tags))
                        .await?;
                    println!("\n✅ Host added: {key} ({})", HostState::Idle);
                }
                Collection::PublicAddresses | Collection::PrivateAddresses => {
                    let mut address = AddressResource::new(&key);
                    address.tags = tags;
                    let store = if matches!(collection, Collection::PrivateAddresses) {
                        &stores.private
                    } else {
                        &stores.public
                    };
                    store.create(&address).await?;
                    println!("\n✅ Address added: {key}");
                }
            }
        }

        Commands::Delete { collection, key } => {
            match collection {
                Collection::Hosts => stores.hosts.delete(&key).await?,
                Collection::PublicAddresses => stores.public.delete(&key).await?,
                Collection::PrivateAddresses => stores.private.delete(&key).await?,
            }
            println!("\n✅ Deleted: {key}");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_config(&cli)?;
    let stores = Stores::open(&config, cli.inventory.as_deref()).await?;

    let outcome = run(cli.command, &config, &stores).await;

    if let Some(inventory) = &stores.inventory {
        inventory
            .save()
            .await
            .context("Failed to write inventory back")?;
        info!(dir = %inventory.dir.display(), "Inventory saved");
    }

    outcome
}
