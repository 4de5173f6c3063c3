use std::str::FromStr;

use clap::{Parser, Subcommand};
use common::StopFlag;
use dal::{StorageError, ID};
use tokio::signal::unix::{signal, SignalKind};
use worker::{
    exec_child::{executor_main, ExecutorArgs},
    WorkerError,
};

const EXIT_CMD_LINE: i32 = 1;
const EXIT_SIGNAL_INSTALL: i32 = 2;
const EXIT_STORAGE_CONNECT: i32 = 4;
const EXIT_STORAGE: i32 = 5;
const EXIT_TASK: i32 = 6;
const EXIT_SIGNAL_BASE: i32 = 128;

#[derive(Parser, Debug)]
#[command(name = "spider", author, version, about = "Spider distributed task execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker daemon.
    Worker {
        /// Storage server url (postgres://… or memory://).
        #[arg(long = "storage_url")]
        storage_url: String,

        /// Worker host address, used for data locality decisions.
        #[arg(long)]
        host: String,

        /// Task libraries to enable; repeat for more than one.
        #[arg(long = "libs", required = true)]
        libs: Vec<String>,
    },

    /// Run a scheduler daemon.
    Scheduler {
        #[arg(long = "storage_url")]
        storage_url: String,

        /// Address workers reach this scheduler at.
        #[arg(long)]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Create the storage schema.
    Init {
        #[arg(long = "storage_url")]
        storage_url: String,
    },

    /// Internal: task executor child process.
    #[command(hide = true)]
    Executor {
        #[arg(long)]
        func: String,

        #[arg(long = "task_id")]
        task_id: String,

        #[arg(long = "instance_id")]
        instance_id: String,

        #[arg(long = "storage_url")]
        storage_url: String,

        #[arg(long = "libs")]
        libs: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return EXIT_CMD_LINE;
        }
    };

    match cli.command {
        Command::Worker {
            storage_url,
            host,
            libs,
        } => {
            let worker_id = ID::new();
            common::logging::setup("spider.worker", worker_id.as_uuid());

            let result = worker::entry::entry(worker::entry::WorkerArgs {
                worker_id,
                storage_url,
                host,
                libs,
            })
            .await;

            match result {
                Ok(()) => exit_for_clean_shutdown(),
                Err(WorkerError::CmdLineInvalid(e)) => {
                    tracing::error!("{e}");
                    EXIT_CMD_LINE
                }
                Err(WorkerError::SignalInstallFailed(e)) => {
                    tracing::error!("{e}");
                    EXIT_SIGNAL_INSTALL
                }
                Err(WorkerError::StorageConnect(e)) => {
                    tracing::error!("{e}");
                    EXIT_STORAGE_CONNECT
                }
                Err(WorkerError::Storage(e)) => {
                    tracing::error!("{e}");
                    EXIT_STORAGE
                }
                Err(WorkerError::Task(e)) => {
                    tracing::error!("{e}");
                    EXIT_TASK
                }
            }
        }

        Command::Scheduler {
            storage_url,
            host,
            port,
        } => {
            let scheduler_id = ID::new();
            common::logging::setup("spider.scheduler", scheduler_id.as_uuid());

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!("Fail to install signal handler for SIGTERM: {e}");
                    return EXIT_SIGNAL_INSTALL;
                }
            };
            tokio::spawn(async move {
                sigterm.recv().await;
                tracing::info!("SIGTERM received, requesting stop");
                StopFlag::request_stop();
            });

            match scheduler::entry::entry(scheduler_id, &storage_url, &host, port).await {
                Ok(()) => exit_for_clean_shutdown(),
                Err(e) => {
                    tracing::error!("scheduler failed: {e}");
                    match e.downcast_ref::<StorageError>() {
                        Some(StorageError::Connection(_)) => EXIT_STORAGE_CONNECT,
                        _ => EXIT_STORAGE,
                    }
                }
            }
        }

        Command::Init { storage_url } => {
            common::logging::setup("spider.init", uuid::Uuid::new_v4());

            if storage_url.starts_with("memory://") {
                tracing::info!("the in-memory store needs no schema");
                return 0;
            }

            let pg = match storage::pg::PgStorage::connect(&storage_url).await {
                Ok(pg) => pg,
                Err(e) => {
                    tracing::error!("Failed to connect to storage: {e}");
                    return EXIT_STORAGE_CONNECT;
                }
            };
            match pg.initialize().await {
                Ok(()) => {
                    tracing::info!("storage schema is ready");
                    0
                }
                Err(e) => {
                    tracing::error!("schema setup failed: {e}");
                    EXIT_STORAGE
                }
            }
        }

        Command::Executor {
            func,
            task_id,
            instance_id,
            storage_url,
            libs,
        } => {
            common::logging::setup("spider.executor", uuid::Uuid::new_v4());

            let (Ok(task_id), Ok(instance_id)) =
                (ID::from_str(&task_id), ID::from_str(&instance_id))
            else {
                tracing::error!("task_id and instance_id must be UUIDs");
                return EXIT_CMD_LINE;
            };

            executor_main(ExecutorArgs {
                func,
                task_id,
                instance_id,
                storage_url,
                libs,
            })
            .await
        }
    }
}

/// A clean exit after a SIGTERM-driven stop reports 128+SIGTERM, matching
/// the convention for signal-terminated daemons.
fn exit_for_clean_shutdown() -> i32 {
    if StopFlag::is_stop_requested() {
        EXIT_SIGNAL_BASE + libc::SIGTERM
    } else {
        0
    }
}

// Link the demo task library into the binary so its registrations exist.
#[allow(unused_imports)]
use tasklib as _;
