//! A grey-box, capture-seeded fuzzer for gRPC services, with coverage
//! feedback through a frida agent.

mod config;

use std::{path::Path, time::Duration};

use clap::{App, Arg};
use log::{info, warn};
use tokio::sync::watch;

use ipcfuzz::{
    bolts::{
        os::{MemoryDump, ProcessSupervisor},
        rands::StdRand,
    },
    capture,
    events::EventSubscriber,
    executors::RpcExecutor,
    fuzzer::{FuzzState, IpcFuzzer},
    mutators::MutationMode,
    observers::{CoverageAgent, NopCoverageAgent},
    schema::SchemaSet,
    stats::{output::OutputSink, SimpleStats},
    Error,
};

use crate::config::Configuration;

#[cfg(windows)]
const DEFAULT_CONFIG_PATH: &str = r"C:\ipcfuzz\config.json";
#[cfg(not(windows))]
const DEFAULT_CONFIG_PATH: &str = "/etc/ipcfuzz/config.json";

/// Dial timeout towards the target endpoint.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The main fn, parsing parameters and starting the fuzzer
pub fn main() {
    env_logger::init();

    let matches = App::new("grpc_ipc")
        .version("0.1.0")
        .about("grey-box feedback-based fuzzer for gRPC services")
        .arg(
            Arg::new("cfg")
                .short('c')
                .long("cfg")
                .value_name("CFG")
                .help("Path to the run configuration")
                .takes_value(true),
        )
        .get_matches();

    let cfg_path = matches.value_of("cfg").unwrap_or(DEFAULT_CONFIG_PATH);
    let config = match Configuration::load(Path::new(cfg_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not load configuration {cfg_path}: {err}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start the runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(fuzz(config)) {
        Ok(()) | Err(Error::ShuttingDown) => println!("\nFinished fuzzing. Good bye."),
        Err(
            err @ (Error::BadCapture(_)
            | Error::BadSchema(_)
            | Error::DryRunFailed(_)
            | Error::EmptyCorpus),
        ) => {
            eprintln!("initialization failed: {err}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("error during fuzzing: {err}");
            std::process::exit(1);
        }
    }
}

/// The actual fuzzer
async fn fuzz(config: Configuration) -> Result<(), Error> {
    if config.ssl {
        warn!("ssl is reserved and not yet honored; continuing in plaintext");
    }

    let schemas = SchemaSet::compile(&config.proto_files_path, &config.proto_files_include_path)?;
    let messages = capture::decode(&config.pcap_file_path, &schemas)?;
    info!("decoded {} typed messages from the capture", messages.len());

    let mut state = FuzzState::from_capture(&messages, StdRand::new())?;

    // First signal asks the loop to wind down at the next boundary; the
    // second one does not wait for anyone.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nshutting down, press ^C again to hard-exit");
            let _ = cancel_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(2);
        }
    });

    let memory_dump = match (&config.perform_memory_dump, &config.dump_executable_path) {
        (true, Some(dump_tool)) => Some(MemoryDump::new(
            config.path_to_executable.clone(),
            config.output_path.clone(),
            dump_tool.clone(),
        )),
        (true, None) => {
            warn!("performMemoryDump set without dumpExecutablePath; dumps disabled");
            None
        }
        _ => None,
    };

    let mutation_mode = if config.single_field_mutation {
        MutationMode::SingleField
    } else {
        MutationMode::WholeMessage
    };

    let mut fuzzer = IpcFuzzer::builder()
        .executor(RpcExecutor::new(&config.host, config.port, DIAL_TIMEOUT))
        .agent(build_agent(config.use_instrumentation)?)
        .events(build_events())
        .supervisor(ProcessSupervisor::new(
            config.path_to_executable.clone(),
            config.executable_args.clone(),
        ))
        .output(OutputSink::new(&config.output_path)?)
        .stats(SimpleStats::new(|line| println!("{line}")))
        .handlers(config.handlers.clone())
        .mutation_mode(mutation_mode)
        .dependency_unaware(config.dependency_unaware_sending)
        .use_instrumentation(config.use_instrumentation)
        .perform_dry_run(config.perform_dry_run)
        .max_msg_size(config.max_msg_size)
        .memory_dump(memory_dump)
        .cancel(cancel_rx)
        .build();

    fuzzer.run(&mut state).await
}

fn build_agent(use_instrumentation: bool) -> Result<Box<dyn CoverageAgent>, Error> {
    if !use_instrumentation {
        return Ok(Box::new(NopCoverageAgent));
    }
    #[cfg(feature = "frida")]
    {
        Ok(Box::new(ipcfuzz_frida::FridaCoverageAgent::new()?))
    }
    #[cfg(not(feature = "frida"))]
    {
        warn!("built without frida support; coverage feedback disabled");
        Ok(Box::new(NopCoverageAgent))
    }
}

#[cfg(windows)]
fn build_events() -> Box<dyn EventSubscriber> {
    Box::new(ipcfuzz::events::WinEventSubscriber::new("Application", "*"))
}

#[cfg(not(windows))]
fn build_events() -> Box<dyn EventSubscriber> {
    Box::new(ipcfuzz::events::NullEventSubscriber)
}
