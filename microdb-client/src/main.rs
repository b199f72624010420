use std::error::Error;
use std::io::{self, Read, Write};
use std::net::TcpStream;

use clap::Parser;

use microdb::protocol;

/// Interactive client: waits for admission, then forwards one command per
/// line and prints each response. `EXIT` closes the connection locally and
/// is never sent over the wire.
#[derive(Parser)]
#[command(name = "microdb-client")]
struct Opts {
    /// Server host name or address.
    host: String,
    /// Server TCP port.
    port: u16,
}

fn print_help() {
    println!("Available commands:");
    println!("  QUERY <term>           (e.g., QUERY Ana, QUERY Cordoba)");
    println!("  BEGIN_TRANSACTION      (Starts an exclusive transaction)");
    println!("  COMMIT_TRANSACTION     (Ends the active transaction)");
    println!("  ADD <ID>,<Nombre>,<Edad>,<Ciudad>,<Fuente>");
    println!("  MODIFY <ID> <ID>,<Nombre>,<Edad>,<Ciudad>,<Fuente>");
    println!("  DELETE <ID>            (e.g., DELETE 2)");
    println!("  EXIT                   (Disconnects from server)");
    println!("{}", "-".repeat(60));
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts = Opts::parse();
    let mut stream = TcpStream::connect((opts.host.as_str(), opts.port))?;
    println!("Connected to server {}:{}", opts.host, opts.port);

    let mut buf = [0u8; 4096];

    // Admission phase: print every server message; the ready/your-turn
    // substrings switch to command mode, a refusal ends the session, any
    // other message keeps us waiting.
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            println!("Server disconnected.");
            return Ok(());
        }
        let message = String::from_utf8_lossy(&buf[..n]).into_owned();
        print!("{}", message);
        if protocol::is_refusal(&message) {
            return Ok(());
        }
        if protocol::is_ready_message(&message) {
            break;
        }
        println!("Waiting for a free slot...");
    }

    print_help();
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("\n> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let command = line.trim_end_matches(['\r', '\n']);
        if command == "EXIT" {
            break;
        }
        if command.is_empty() {
            continue;
        }
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;

        let n = stream.read(&mut buf)?;
        if n == 0 {
            println!("Server disconnected.");
            break;
        }
        println!("Server response:\n{}", String::from_utf8_lossy(&buf[..n]));
    }

    println!("Disconnected from server.");
    Ok(())
}
