mod demo;

use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use objbridge::vm::value::{ObjRef, Object};
use objbridge::vm::{ImportContext, Vm};
use objbridge::{Bridge, BridgeConfig, BridgeError, BridgeResult};

#[derive(Parser)]
#[command(name = "objbridge")]
#[command(about = "Load a demo native extension through the object bridge")]
struct Args {
    /// Path to a JSON bridge config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log bridge activity to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Name to import the demo module under
    #[arg(short, long, default_value = "demo.native")]
    module: String,
}

/// Route the library's `log` records to a stderr subscriber.
fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> BridgeResult<()> {
    let config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    let vm = Rc::new(Vm::new());
    let bridge = Bridge::new(config, vm.clone())?;

    // The extension asks for its last name component, like a C init function
    let short = args.module.rsplit('.').next().unwrap_or(&args.module);
    vm.push_import(ImportContext {
        name: Some(args.module.clone()),
        file: None,
    });
    let handle = {
        let _guard = bridge.enter()?;
        demo::init(short)
    };
    vm.pop_import();
    if handle.is_null() {
        return Err(bridge
            .take_last_error()
            .unwrap_or_else(|| BridgeError::UnknownModule(args.module.clone())));
    }

    let module = bridge
        .get_module(&args.module)
        .ok_or_else(|| BridgeError::UnknownModule(args.module.clone()))?;
    let namespace = module
        .as_module()
        .ok_or_else(|| BridgeError::UnknownModule(args.module.clone()))?;
    println!("module {}", args.module);
    for name in namespace.attr_names() {
        println!("  {}", name);
    }

    let call = |name: &str, positional: &[ObjRef], kwargs: &[(String, ObjRef)]| -> BridgeResult<ObjRef> {
        namespace
            .get_attr(name)
            .ok_or_else(|| BridgeError::Argument(format!("module has no function '{}'", name)))?
            .call(positional, kwargs)
    };

    println!("version() = {:?}", call("version", &[], &[])?);
    println!("square(12) = {:?}", call("square", &[ObjRef::int(12)], &[])?);
    println!(
        "count(1, 2, flag=True) = {:?}",
        call(
            "count",
            &[ObjRef::int(1), ObjRef::int(2)],
            &[("flag".to_string(), ObjRef::new(Object::Bool(true)))],
        )?
    );
    match call("fail", &[], &[]) {
        Ok(value) => println!("fail() = {:?}", value),
        Err(e) => println!("fail() raised: {}", e),
    }

    let token = call("make_token", &[], &[])?;
    println!("read_token(token) = {:?}", call("read_token", &[token.clone()], &[])?);
    drop(token);
    println!("collected {} finalizable proxies", bridge.collect_garbage());

    let stats = bridge.heap_stats();
    println!(
        "heap: {} bytes in {} live blocks ({} bytes allocated in total)",
        stats.bytes_in_use, stats.live_blocks, stats.total_allocated
    );
    println!(
        "{} bound handles, modules: {}",
        bridge.bound_count(),
        bridge.modules().names().join(", ")
    );
    bridge.dispose();
    Ok(())
}
