//! devio-serve CLI tool
//!
//! Serves a disk image to a block-proxy peer over TCP or shared memory.

use std::process;
use std::sync::mpsc;

use devio::provider::{
    FakeMbrProvider, FileProvider, OffsetProvider, SharedProvider, StorageProvider,
};
use devio::transport::{ShmTransport, TcpTransport};
use devio::{DevioService, ServiceEvent};

fn main() {
    devio::logging::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

enum Endpoint {
    Tcp(String),
    Shm(String),
}

struct Options {
    endpoint: Endpoint,
    image: String,
    read_only: bool,
    unbuffered: bool,
    offset: u64,
    detect_length: bool,
    fake_mbr: bool,
    buffer_size: Option<usize>,
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "tcp" | "shm" => cmd_serve(&args[1..])?,
        "help" | "--help" | "-h" => print_usage(&args[0]),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"devio-serve - serve a disk image to a block-proxy peer

USAGE:
    {} tcp <ADDR> <IMAGE> [OPTIONS]
    {} shm <NAME> <IMAGE> [OPTIONS]

OPTIONS:
    --read-only          Refuse writes
    --unbuffered         Bypass the host cache for aligned transfers
    --offset <BYTES>     Serve the image starting at this byte offset
    --detect-length      Size the served window from the volume boot sector
    --fake-mbr           Present a raw volume as a partitioned disk
    --buffer-size <N>    Largest transfer (tcp) or section size (shm) in bytes

ENVIRONMENT:
    DEVIO_LOG            Log filter, e.g. "debug" or "devio::transport=trace"

EXAMPLES:
    {} tcp 0.0.0.0:9000 disk.img
    {} shm disk0 volume.img --offset 1048576 --fake-mbr
"#,
        program, program, program, program
    );
}

fn print_version() {
    println!("devio-serve {}", env!("CARGO_PKG_VERSION"));
}

fn parse_options(args: &[String]) -> Result<Options, Box<dyn std::error::Error>> {
    if args.len() < 3 {
        return Err(format!("{} requires an endpoint and an image path", args[0]).into());
    }
    let endpoint = match args[0].as_str() {
        "tcp" => Endpoint::Tcp(args[1].clone()),
        _ => Endpoint::Shm(args[1].clone()),
    };
    let mut options = Options {
        endpoint,
        image: args[2].clone(),
        read_only: false,
        unbuffered: false,
        offset: 0,
        detect_length: false,
        fake_mbr: false,
        buffer_size: None,
    };

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--read-only" | "-r" => options.read_only = true,
            "--unbuffered" => options.unbuffered = true,
            "--detect-length" => options.detect_length = true,
            "--fake-mbr" => options.fake_mbr = true,
            "--offset" | "-o" => {
                i += 1;
                if i >= args.len() {
                    return Err("--offset requires a number".into());
                }
                options.offset = args[i].parse()?;
            }
            "--buffer-size" | "-b" => {
                i += 1;
                if i >= args.len() {
                    return Err("--buffer-size requires a number".into());
                }
                options.buffer_size = Some(args[i].parse()?);
            }
            other => return Err(format!("Unknown option: {}", other).into()),
        }
        i += 1;
    }
    Ok(options)
}

fn open_provider(options: &Options) -> devio::Result<Box<dyn StorageProvider>> {
    let file = FileProvider::open(&options.image, !options.read_only, options.unbuffered)?;
    let mut provider: Box<dyn StorageProvider> = Box::new(file);

    if options.offset > 0 || options.detect_length {
        provider = if options.detect_length {
            Box::new(OffsetProvider::with_detected_length(provider, options.offset)?)
        } else {
            Box::new(OffsetProvider::new(provider, options.offset)?)
        };
    }
    if options.fake_mbr {
        provider = Box::new(FakeMbrProvider::new(provider)?);
    }
    Ok(provider)
}

fn cmd_serve(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_options(args)?;
    let provider = SharedProvider::from_boxed(open_provider(&options)?);
    println!(
        "Image: {} ({} bytes{})",
        options.image,
        provider.length(),
        if provider.can_write() { "" } else { ", read-only" }
    );

    let builder = DevioService::builder().provider(provider);
    let builder = match &options.endpoint {
        Endpoint::Tcp(addr) => {
            let mut transport = TcpTransport::new(addr.clone());
            if let Some(size) = options.buffer_size {
                transport = transport.with_max_transfer(size);
            }
            builder.transport(transport)
        }
        Endpoint::Shm(name) => {
            let mut transport = ShmTransport::new(name.clone());
            if let Some(size) = options.buffer_size {
                transport = transport.with_buffer_size(size);
            }
            builder.transport(transport)
        }
    };
    let mut service = builder.read_only(options.read_only).build()?;

    let (events_tx, events) = mpsc::channel();
    service.subscribe(move |event| {
        let _ = events_tx.send(event.clone());
    });

    service.start()?;
    println!("Serving on {}", service.proxy_identity());

    for event in events {
        match event {
            ServiceEvent::UnhandledFault(reason) => eprintln!("Fault: {}", reason),
            ServiceEvent::Shutdown => break,
            _ => {}
        }
    }
    service.stop();
    println!("Done");
    Ok(())
}
