use std::env;
use std::process::exit;

use getopts::Options;
use log::{debug, info};

use tcplens::analyzer::Analyzer;
use tcplens::flow::registry::{FlowMap, SenderSelector};
use tcplens::phy::PacketSource;
use tcplens::unit::Unit;
use tcplens::wire::Ipv4Address;

fn usage(program: &str, opts: &Options) -> ! {
    let brief = format!("Usage: {program} [options] <srcAddress> [<dstAddress>] <interface-or-file>");
    eprint!("{}", opts.usage(&brief));
    exit(1)
}

fn parse_addr(program: &str, opts: &Options, arg: &str) -> Ipv4Address {
    match arg.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("bad IPv4 address: {arg}");
            usage(program, opts)
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(_) => usage(&program, &opts),
    };
    if matches.opt_present("h") {
        usage(&program, &opts);
    }

    let (src, dst, target) = match matches.free.as_slice() {
        [src, target] => (parse_addr(&program, &opts, src), None, target.clone()),
        [src, dst, target] => (
            parse_addr(&program, &opts, src),
            Some(parse_addr(&program, &opts, dst)),
            target.clone(),
        ),
        _ => usage(&program, &opts),
    };

    let mut source = match PacketSource::open(&target) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot open {target}: {e}");
            exit(1)
        }
    };
    let link_type = source.link_type();

    let selector = SenderSelector::new(src, dst);
    let mut flows = FlowMap::new(selector, Analyzer::new);

    let mut total_packets: u64 = 0;
    let mut invalid_packets: u64 = 0;
    while let Some((when, data)) = source.next_frame() {
        total_packets += 1;
        let unit = match Unit::decode(&data, link_type, when) {
            Ok(unit) => unit,
            Err(e) => {
                invalid_packets += 1;
                debug!("unpack error: {e}");
                continue;
            }
        };
        if let Some(analyzer) = flows.dispatch(&unit) {
            println!("{}", analyzer.summary());
        }
    }

    for analyzer in flows.close_all() {
        println!("{}", analyzer.summary());
    }
    info!("{total_packets} packets, {invalid_packets} undecodable");
}
