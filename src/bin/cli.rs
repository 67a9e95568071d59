use clap::{App, Arg, ArgMatches, SubCommand};
use seurat::{
    config::ROOT_ENV, memory::default_root, Discovery, Domain, DomainConfig, EndpointKind,
    MessagingPattern, Result, SeuratError,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

fn main() -> Result<()> {
    env_logger::init();

    let matches = App::new("seurat-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Seurat shared memory pub/sub inspection tool")
        .arg(
            Arg::with_name("root")
                .short("r")
                .long("root")
                .value_name("DIR")
                .help("Root directory of all domains (defaults to $SEURAT_ROOT or /dev/shm/seurat)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("heartbeat")
                .long("heartbeat-timeout")
                .value_name("MS")
                .help("Treat endpoints with an older heartbeat as dead")
                .takes_value(true)
                .global(true),
        )
        .subcommand(SubCommand::with_name("domains").about("List domains"))
        .subcommand(
            SubCommand::with_name("topics")
                .about("List the topics of a domain")
                .arg(
                    Arg::with_name("domain")
                        .help("Domain name")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("endpoints")
                .about("List the live endpoints of a topic")
                .arg(
                    Arg::with_name("domain")
                        .help("Domain name")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("topic")
                        .help("Topic name")
                        .required(true)
                        .index(2),
                ),
        )
        .subcommand(
            SubCommand::with_name("sweep")
                .about("Reclaim endpoints of dead processes in a domain")
                .arg(
                    Arg::with_name("domain")
                        .help("Domain name")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(SubCommand::with_name("info").about("Show build and environment information"))
        .get_matches();

    let root = matches
        .value_of("root")
        .map(PathBuf::from)
        .unwrap_or_else(default_root);
    let heartbeat = parse_heartbeat(&matches)?;

    match matches.subcommand() {
        ("domains", Some(_)) => list_domains(&discovery(&root, heartbeat)),
        ("topics", Some(sub)) => list_topics(&discovery(&root, heartbeat), required(sub, "domain")),
        ("endpoints", Some(sub)) => list_endpoints(
            &discovery(&root, heartbeat),
            required(sub, "domain"),
            required(sub, "topic"),
        ),
        ("sweep", Some(sub)) => sweep(root, heartbeat, required(sub, "domain")),
        ("info", Some(_)) => {
            show_info(&root);
            Ok(())
        }
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    // clap rejects the command line before we get here when it is missing
    matches.value_of(name).unwrap_or_default()
}

fn parse_heartbeat(matches: &ArgMatches) -> Result<Option<Duration>> {
    match matches.value_of("heartbeat") {
        Some(ms) => ms
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| SeuratError::invalid_parameter("heartbeat-timeout", "Expected milliseconds")),
        None => Ok(None),
    }
}

fn discovery(root: &Path, heartbeat: Option<Duration>) -> Discovery {
    Discovery::new(root).with_heartbeat_timeout(heartbeat)
}

fn list_domains(discovery: &Discovery) -> Result<()> {
    let domains = discovery.list_domains()?;
    if domains.is_empty() {
        println!("No domains below {}", discovery.root().display());
        return Ok(());
    }

    println!("{:<32} {:>6}  PATH", "DOMAIN", "TOPICS");
    for domain in domains {
        println!(
            "{:<32} {:>6}  {}",
            domain.name,
            domain.topic_count,
            domain.path.display()
        );
    }
    Ok(())
}

fn list_topics(discovery: &Discovery, domain: &str) -> Result<()> {
    let topics = discovery.list_topics(domain)?;
    if topics.is_empty() {
        println!("No topics in domain {}", domain);
        return Ok(());
    }

    println!(
        "{:<24} {:<18} {:<20} {:>8} {:>6} {:>5} {:>5}  POOL",
        "TOPIC", "PATTERN", "TYPE", "PAYLOAD", "SLOTS", "PROD", "CONS"
    );
    for topic in topics {
        let pool = match topic.pattern {
            MessagingPattern::Event => format!("{} event ids", topic.event_capacity),
            MessagingPattern::PublishSubscribe => topic.pool.summary(),
        };
        println!(
            "{:<24} {:<18} {:<20} {:>8} {:>6} {:>5} {:>5}  {}{}",
            topic.name,
            topic.pattern.name(),
            topic.type_descriptor.type_name,
            topic.payload_size,
            topic.pool_capacity,
            topic.producers,
            topic.consumers,
            pool,
            if topic.persistent { " [persistent]" } else { "" }
        );
    }
    Ok(())
}

fn list_endpoints(discovery: &Discovery, domain: &str, topic: &str) -> Result<()> {
    let endpoints = discovery.list_endpoints(domain, topic)?;
    if endpoints.is_empty() {
        println!("No live endpoints on {}/{}", domain, topic);
        return Ok(());
    }

    println!(
        "{:>6} {:<10} {:>8} {:<12} {:>10} {:>8} {:>6}",
        "ID", "KIND", "PID", "POLICY", "SAMPLES", "DROPPED", "PEERS"
    );
    for endpoint in endpoints {
        println!(
            "{:>6} {:<10} {:>8} {:<12} {:>10} {:>8} {:>6}",
            endpoint.id,
            endpoint.kind.name(),
            endpoint.pid,
            if endpoint.kind == EndpointKind::Subscriber {
                endpoint.policy.name()
            } else {
                "-"
            },
            endpoint.samples,
            endpoint.dropped,
            endpoint.peers
        );
    }
    Ok(())
}

fn sweep(root: PathBuf, heartbeat: Option<Duration>, domain: &str) -> Result<()> {
    let config = DomainConfig::new(domain)
        .with_root_dir(root)
        .with_heartbeat_timeout(heartbeat);
    let domain = Domain::open(config)?;
    let report = domain.sweep()?;

    println!("Swept {} topics of {}", report.segments_scanned, domain.name());
    println!("  publishers reclaimed:  {}", report.publishers_reclaimed);
    println!("  subscribers reclaimed: {}", report.subscribers_reclaimed);
    println!("  notifiers reclaimed:   {}", report.notifiers_reclaimed);
    println!("  listeners reclaimed:   {}", report.listeners_reclaimed);
    println!("  slots reclaimed:       {}", report.slots_reclaimed);
    println!("  references released:   {}", report.references_released);
    Ok(())
}

fn show_info(root: &Path) {
    println!("Seurat {}", seurat::VERSION);
    println!("Root directory: {}", root.display());
    match std::env::var(ROOT_ENV) {
        Ok(value) => println!("{}: {}", ROOT_ENV, value),
        Err(_) => println!("{}: (unset)", ROOT_ENV),
    }
    println!(
        "Wait primitive: {}",
        if cfg!(target_os = "linux") {
            "futex"
        } else {
            "sleep polling"
        }
    );
}
