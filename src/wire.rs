use stacked_errors::{Result, StackableErr};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// The framing is Redis-inspired (http://redis.io/topics/protocol): a request
// is a sequence of `*<N>\r\n` arrays of `$<len>\r\n<bytes>\r\n` bulk strings,
// a reply is a single `+`/`-` status line. The reply side historically mixed
// `\r\n` and `\n`; both are accepted on read and `\n` is emitted on write.

/// A single parsed operation: a lowercased name plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub name: String,
    pub args: Vec<String>,
}

/// Framing violations. These fail the whole session, unlike op errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Malformed request: '{line}' doesn't start with '{sentinel}<nArg>'")]
    BadPrefix { sentinel: char, line: String },
    #[error("Malformed request: expected '\\n', got '{got:#04x}'")]
    MissingNewline { got: u8 },
    #[error(
        "Malformed request: argument data #{index} doesn't match declared size (expected {expected} + \\r\\n)"
    )]
    ShortArg { index: u64, expected: u64 },
    #[error("Malformed request: argument #{index} doesn't end with \\r\\n")]
    BadArgTerminator { index: u64 },
    #[error("Malformed request: argument #{index} is not UTF-8")]
    BadArgEncoding { index: u64 },
    #[error("Engine unexpectedly hung up")]
    HungUp,
    #[error("Engine returned unknown reply code '{code}': (\"{line}\")")]
    UnknownReplyCode { code: char, line: String },
}

// reads through the next '\r' and parses `<sentinel><decimal>` out of it
async fn read_sized_prefix<R: AsyncBufRead + Unpin>(reader: &mut R, sentinel: char) -> Result<u64> {
    let mut line = vec![];
    reader
        .read_until(b'\r', &mut line)
        .await
        .stack_err("read_sized_prefix -> read failed")?;
    if line.last() != Some(&b'\r') {
        return Err(WireError::BadPrefix {
            sentinel,
            line: String::from_utf8_lossy(&line).into_owned(),
        })
        .stack();
    }
    line.pop();
    let parsed = std::str::from_utf8(&line)
        .ok()
        .and_then(|s| s.strip_prefix(sentinel))
        .and_then(|n| n.parse::<u64>().ok());
    let n = match parsed {
        Some(n) => n,
        None => {
            return Err(WireError::BadPrefix {
                sentinel,
                line: String::from_utf8_lossy(&line).into_owned(),
            })
            .stack()
        }
    };
    let mut nl = [0u8; 1];
    reader
        .read_exact(&mut nl)
        .await
        .stack_err("read_sized_prefix -> read failed")?;
    if nl[0] != b'\n' {
        return Err(WireError::MissingNewline { got: nl[0] }).stack();
    }
    Ok(n)
}

/// Parses one operation array off the request stream. Any framing violation
/// is an error that the session treats as fatal.
pub async fn read_op<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Op> {
    let n_arg = read_sized_prefix(reader, '*')
        .await
        .stack_err_locationless("read_op -> bad op header")?;
    let mut op = Op {
        name: String::new(),
        args: vec![],
    };
    for i in 0..n_arg {
        let arg_size = read_sized_prefix(reader, '$')
            .await
            .stack_err_locationless("read_op -> bad argument header")?;
        // the declared bytes plus the literal `\r\n` terminator
        let mut arg_data = vec![0u8; usize::try_from(arg_size).stack()? + 2];
        match reader.read_exact(&mut arg_data).await {
            Ok(_) => (),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ShortArg {
                    index: i,
                    expected: arg_size,
                })
                .stack()
            }
            Err(e) => return Err(e).stack_err("read_op -> read failed"),
        }
        if &arg_data[arg_data.len() - 2..] != b"\r\n" {
            return Err(WireError::BadArgTerminator { index: i }).stack();
        }
        arg_data.truncate(arg_data.len() - 2);
        let arg = match String::from_utf8(arg_data) {
            Ok(arg) => arg,
            Err(_) => return Err(WireError::BadArgEncoding { index: i }).stack(),
        };
        if i == 0 {
            op.name = arg.to_lowercase();
        } else {
            op.args.push(arg);
        }
    }
    Ok(op)
}

/// Encodes one operation array (op name first) onto the request stream
pub async fn write_op<W: AsyncWrite + Unpin>(writer: &mut W, op_args: &[String]) -> Result<()> {
    let mut buf = format!("*{}\r\n", op_args.len()).into_bytes();
    for arg in op_args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    writer
        .write_all(&buf)
        .await
        .stack_err("write_op -> write failed")?;
    writer.flush().await.stack_err("write_op -> flush failed")?;
    Ok(())
}

/// Reads one status line: `+` success or `-` error plus human-readable text.
/// Accepts either `\n` or `\r\n` termination.
pub async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<(char, String)> {
    let mut line = vec![];
    reader
        .read_until(b'\n', &mut line)
        .await
        .stack_err("read_reply -> read failed")?;
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.is_empty() {
        return Err(WireError::HungUp).stack();
    }
    let code = char::from(line[0]);
    let text = String::from_utf8_lossy(&line[1..]).into_owned();
    match code {
        '+' | '-' => Ok((code, text)),
        _ => Err(WireError::UnknownReplyCode {
            code,
            line: String::from_utf8_lossy(&line).into_owned(),
        })
        .stack(),
    }
}

/// Emits one status line, `\n` terminated
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: char,
    text: &str,
) -> Result<()> {
    let mut buf = String::with_capacity(text.len() + 2);
    buf.push(code);
    buf.push_str(text);
    buf.push('\n');
    writer
        .write_all(buf.as_bytes())
        .await
        .stack_err("write_reply -> write failed")?;
    writer
        .flush()
        .await
        .stack_err("write_reply -> flush failed")?;
    Ok(())
}
