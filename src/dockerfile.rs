use stacked_errors::{bail, Result};
use tracing::info;

/// Parses a build file into the chain of op argument lists to send to the
/// engine. Line oriented: blank lines and `#` comments are skipped, the first
/// token is the lowercased op name, and the remainder of the line is a single
/// argument. `run <rest>` is rewritten to `exec /bin/sh -c <rest>` for
/// backward compatibility. There are no continuation semantics.
pub fn parse_dockerfile(input: &str) -> Result<Vec<Vec<String>>> {
    let mut chain = vec![];
    for line in input.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        info!("build op '{line}'");
        // FIXME: split in different numbers of parts depending on the op
        // (this is to respect backwards compatibility with the current
        // dockerfile format)
        let mut parts = match line.split_once(' ') {
            Some((op, rest)) => vec![op.to_lowercase(), rest.to_owned()],
            None => vec![line.to_lowercase()],
        };
        if parts[0] == "run" {
            if parts.len() < 2 {
                bail!("RUN build operation requires at least one argument")
            }
            parts = vec![
                "exec".to_owned(),
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                parts.swap_remove(1),
            ];
        }
        chain.push(parts);
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_noise_and_lowercases() {
        let chain = parse_dockerfile(
            "# base setup\n\nFROM ubuntu\nIMPORT http://example.com/rootfs.tar\n",
        )
        .unwrap();
        assert_eq!(chain, vec![
            vec!["from".to_owned(), "ubuntu".to_owned()],
            vec![
                "import".to_owned(),
                "http://example.com/rootfs.tar".to_owned()
            ],
        ]);
    }

    #[test]
    fn run_is_rewritten_to_exec() {
        let chain = parse_dockerfile("RUN apt-get install -y curl\n").unwrap();
        assert_eq!(chain, vec![vec![
            "exec".to_owned(),
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            "apt-get install -y curl".to_owned(),
        ]]);
        assert!(parse_dockerfile("RUN\n").is_err());
    }

    #[test]
    fn remainder_stays_one_argument() {
        let chain = parse_dockerfile("echo hello   world\n").unwrap();
        assert_eq!(chain, vec![vec![
            "echo".to_owned(),
            "hello   world".to_owned()
        ]]);
    }
}
