//! Offline segment-length histogram: how the sender's writes split into
//! wire segments, with payloads re-chunked at the path MTU.

use std::env;
use std::process::exit;

use getopts::Options;

use tcplens::phy::PacketSource;
use tcplens::unit::Unit;
use tcplens::wire::Ipv4Address;

const MAX_LEN: usize = 2000;
/// IP MTU minus the IPv4 and TCP fixed headers.
const BASE_MSS: u32 = 1500 - 40;

struct Counter {
    counts: Vec<u32>,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            counts: vec![0; MAX_LEN],
        }
    }

    fn put(&mut self, len: u32) {
        if len as usize >= MAX_LEN {
            eprintln!("bad len {len}");
            exit(1)
        }
        self.counts[len as usize] += 1;
    }

    fn print(&self) {
        for (len, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                println!("{len}: {count}");
            }
        }
        println!();
    }
}

fn usage(program: &str, opts: &Options) -> ! {
    let brief = format!("Usage: {program} <srcAddress> <file>");
    eprint!("{}", opts.usage(&brief));
    exit(1)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    let matches = match opts.parse(&args[1..]) {
        Ok(m) if !m.opt_present("h") && m.free.len() == 2 => m,
        _ => usage(&program, &opts),
    };

    let src: Ipv4Address = match matches.free[0].parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("bad IPv4 address: {}", matches.free[0]);
            usage(&program, &opts)
        }
    };

    let mut source = match PacketSource::open_file(&matches.free[1]) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot open {}: {e}", matches.free[1]);
            exit(1)
        }
    };
    let link_type = source.link_type();

    let mut counter = Counter::new();
    while let Some((when, data)) = source.next_frame() {
        let Ok(unit) = Unit::decode(&data, link_type, when) else {
            continue;
        };
        if unit.src_addr != src {
            continue;
        }

        // what one MTU-sized segment can carry given this unit's options
        let expect = BASE_MSS - unit.option_length;
        let mut len = unit.data_length;
        while len > expect {
            counter.put(expect);
            len -= expect;
        }
        if len > 0 {
            counter.put(len);
        }
    }
    counter.print();
}
