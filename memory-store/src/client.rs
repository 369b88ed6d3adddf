use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

/// Bridges the terminal and a server: stdin lines go out, server output is
/// copied to stdout as it arrives (prompts included).
pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(io::stdin()).lines();

    let mut server_output = tokio::spawn(copy_to_stdout(reader));

    loop {
        select! {
            finished = &mut server_output => {
                finished.context("server output task failed")??;
                write_stdout("*** server closed the connection").await?;
                break;
            }
            line = stdin.next_line() => {
                if !forward_line(line?, &mut writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    server_output.abort();
    Ok(())
}

async fn forward_line(line: Option<String>, writer: &mut OwnedWriteHalf) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(true)
}

async fn copy_to_stdout(mut reader: OwnedReadHalf) -> io::Result<()> {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 1024];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        stdout.write_all(&buf[..read]).await?;
        stdout.flush().await?;
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(b"\n").await?;
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
