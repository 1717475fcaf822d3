/*
 * toykv is one replica of a toykv cluster. It takes the cluster's shared UDP
 * port, its own replica id, and the ids of its peers on the command line,
 * then serves client get/put requests over the cluster's shared endpoint
 * until killed.
 */

#![warn(clippy::all)]

use std::collections::HashSet;

use toykv::error::Result;
use toykv::raft::NodeID;
use toykv::Server;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated key/value store over UDP datagrams.")
        .arg(
            clap::Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("The cluster's shared UDP port"),
        )
        .arg(clap::Arg::new("id").required(true).help("This replica's id"))
        .arg(
            clap::Arg::new("peers")
                .required(true)
                .num_args(1..)
                .help("The ids of the other replicas"),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log-level")
                .default_value("info")
                .help("Log level (off, error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;

    let port = *args.get_one::<u16>("port").unwrap();
    let id = args.get_one::<String>("id").unwrap().clone();
    let peers: HashSet<NodeID> = args.get_many::<String>("peers").unwrap().cloned().collect();

    Server::new(id, peers, port)?.serve()
}
