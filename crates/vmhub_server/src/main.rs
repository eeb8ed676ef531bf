#![forbid(unsafe_code)]

mod config;
mod server;
mod transport;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::captcha::CaptchaVerifier;
use crate::server::channel::UserChannel;
use crate::server::connection::handle_connection;
use crate::server::context::{LoginExecutor, ReservedNames, ServerContext};
use crate::server::db::Db;
use crate::server::exec::Owner;
use crate::server::guests::GuestTable;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::ip_data::IpRegistry;
use crate::server::registry::{VM_INFO_UPDATE_INTERVAL, VmRegistry};
use crate::server::sessions::SessionMap;
use crate::server::settings::SettingsStore;
use crate::server::vm::{NullConnector, Vm, VmSettings};
use vmhub_protocol::GLOBAL_CHANNEL_ID;

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	threads: Option<usize>,
	auto_start_vms: bool,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: vmhub_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind            Listen address (default: 127.0.0.1:6004)\n\
\t--config          Config file path (default: ~/.vmhub/config.toml)\n\
\t--threads         Worker threads (default: number of cores)\n\
\t--auto-start-vms  Start VMs whose settings have auto-start enabled\n\
\t--help            Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: "127.0.0.1:6004".parse().expect("default bind address"),
		config_path: None,
		threads: None,
		auto_start_vms: false,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.bind = v.parse().unwrap_or_else(|e| {
					eprintln!("invalid --bind address: {e}");
					usage_and_exit();
				});
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			"--threads" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let threads = v.parse().unwrap_or_else(|e| {
					eprintln!("invalid --threads value: {e}");
					usage_and_exit();
				});
				args.threads = Some(threads);
			}
			"--auto-start-vms" => args.auto_start_vms = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,vmhub_server=debug".to_string());
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn main() -> anyhow::Result<()> {
	let args = parse_args();

	let mut builder = tokio::runtime::Builder::new_multi_thread();
	builder.enable_all();
	if let Some(threads) = args.threads {
		builder.worker_threads(threads.max(1));
	}
	let runtime = builder.build().context("build runtime")?;
	runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	init_tracing();

	let config_path = match &args.config_path {
		Some(path) => path.clone(),
		None => config::default_config_path()?,
	};
	let cfg = config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded config (toml + env overrides)");

	init_metrics(cfg.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let db = Db::connect(&cfg.database_url).await.context("open database")?;

	let settings_store = SettingsStore::load(db.clone()).await;
	let captcha = CaptchaVerifier::new(settings_store.settings.captcha.clone());

	let reserved_names = ReservedNames::default();
	match db.read_reserved_usernames().await {
		Ok(names) => reserved_names.replace_all(names),
		Err(e) => warn!(error = %e, "failed to load reserved usernames"),
	}

	let ctx = Arc::new(ServerContext {
		db: db.clone(),
		settings: Owner::spawn("server-settings", settings_store),
		sessions: Owner::spawn("sessions", SessionMap::default()),
		guests: Owner::spawn("guests", GuestTable::default()),
		ip_registry: Owner::spawn("ip-registry", IpRegistry::default()),
		vms: Owner::spawn("vm-registry", VmRegistry::default()),
		global_chat: Owner::spawn("global-chat", UserChannel::new(GLOBAL_CHANNEL_ID)),
		login_exec: Owner::spawn("login", LoginExecutor),
		captcha,
		reserved_names,
		connector: Arc::new(NullConnector),
	});

	// Bring persisted VMs back into the registry, auto-starting where the
	// boot flag and the per-VM setting agree.
	let persisted = db.read_all_vm_settings().await.context("load vm settings")?;
	for (vm_id, settings_list) in persisted {
		let settings = match VmSettings::from_list(&settings_list) {
			Ok(settings) => settings,
			Err(e) => {
				warn!(vm_id, error = e, "skipping vm with invalid persisted settings");
				continue;
			}
		};
		let auto_start = args.auto_start_vms && settings.auto_start;
		let name = settings.name.clone();
		let vm = Vm::spawn(vm_id, settings, db.clone(), Arc::clone(&ctx.connector));
		if auto_start {
			vm.start();
		}
		ctx.vms.dispatch(move |registry| registry.insert(vm, name));
	}

	// Periodic info/thumbnail refresh pushed to list viewers.
	{
		let vms = ctx.vms.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(VM_INFO_UPDATE_INTERVAL);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				let owner = vms.clone();
				vms.dispatch(move |registry| registry.update_vm_info_list(&owner));
			}
		});
	}

	let listener = tokio::net::TcpListener::bind(args.bind)
		.await
		.with_context(|| format!("bind {}", args.bind))?;
	info!(bind = %args.bind, "vmhub server listening");
	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("vmhub_server_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		tokio::spawn(async move {
			if let Err(e) = handle_connection(ctx, conn_id, stream, remote.ip()).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
