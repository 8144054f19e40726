use clap::CommandFactory;
use clap_complete::aot::{generate, Shell};
use std::io::BufWriter;

fn completions(shell: Shell) -> String {
    let mut buf = BufWriter::new(Vec::new());
    generate(shell, &mut workspaced::cli::Cli::command(), "workspaced", &mut buf);
    String::from_utf8(buf.into_inner().unwrap()).unwrap()
}

#[test]
fn completions_bash_generates_output() {
    let output = completions(Shell::Bash);
    assert!(output.contains("workspaced"));
    assert!(output.contains("parse-log"));
}

#[test]
fn completions_zsh_generates_output() {
    let output = completions(Shell::Zsh);
    assert!(!output.is_empty(), "zsh completions should not be empty");
}
