use anyhow::{bail, Context, Result};
use mmo_common::chunked::{fixed_len, ChunkReassembler, ChunkedWriter, CorrelationId};
use mmo_common::config::CommonConfig;

const USAGE: &str = "Usage: chunk_cli [--conf FILE] [--client] [--chunk-size N] [--id HEX] [--corr N] [--dump] FILE";

fn main() -> Result<()> {
    let mut conf_file: Option<String> = None;
    let mut input: Option<String> = None;
    let mut client = false;
    let mut chunk_size: Option<usize> = None;
    let mut packet_id: u16 = 0x3800;
    let mut corr: u16 = 0;
    let mut dump = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("{}", USAGE);
                return Ok(());
            }
            "--conf" | "--chunk-size" | "--id" | "--corr" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: {} requires an argument", args[i]);
                    return Ok(());
                }
                let value = &args[i + 1];
                match args[i].as_str() {
                    "--conf" => conf_file = Some(value.clone()),
                    "--chunk-size" => {
                        chunk_size = Some(value.parse().with_context(|| format!("Bad chunk size: {}", value))?)
                    }
                    "--id" => {
                        packet_id = u16::from_str_radix(value.trim_start_matches("0x"), 16)
                            .with_context(|| format!("Bad packet id: {}", value))?
                    }
                    _ => corr = value.parse().with_context(|| format!("Bad correlation id: {}", value))?,
                }
                i += 1;
            }
            "--client" => client = true,
            "--dump" => dump = true,
            other => input = Some(other.to_string()),
        }
        i += 1;
    }

    let config = match &conf_file {
        Some(path) => CommonConfig::from_file(path)?,
        None => CommonConfig::default(),
    };
    mmo_common::core::init_logging(&config.log_filter);

    let Some(input) = input else {
        eprintln!("{}", USAGE);
        bail!("no input file");
    };
    let data = std::fs::read(&input).with_context(|| format!("Cannot read input: {}", input))?;

    let chunk_size = chunk_size.unwrap_or(if client {
        config.chunk.client_chunk_size
    } else {
        config.chunk.inter_server_chunk_size
    });

    let writer = ChunkedWriter::new(packet_id, CorrelationId(corr), &data, chunk_size)?;
    tracing::info!(
        "[chunk_cli] {} bytes -> {} packets of up to {} bytes",
        data.len(),
        writer.packet_count(),
        chunk_size
    );

    let header_len = fixed_len::<CorrelationId>();
    let mut reassembler: ChunkReassembler<CorrelationId> = config.chunk.reassembler();
    let mut result = None;

    for (n, packet) in writer.packets().enumerate() {
        if dump {
            let preview = &packet[header_len..packet.len().min(header_len + 16)];
            println!(
                "#{:<5} len={:<6} header={} data={}",
                n,
                packet.len(),
                hex::encode(&packet[..header_len]),
                hex::encode(preview)
            );
        }
        match reassembler.push(&packet) {
            Ok(done) => result = done.or(result),
            Err(e) => bail!("reassembly failed at packet {}: {}", n, e),
        }
    }

    match result {
        Some(done) if done.data == data => {
            println!("OK {} bytes in {} packets", done.data.len(), writer.packet_count());
            Ok(())
        }
        Some(done) => bail!("payload mismatch: sent {} bytes, got {}", data.len(), done.data.len()),
        None => bail!("transfer never completed"),
    }
}
