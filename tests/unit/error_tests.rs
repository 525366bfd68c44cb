//! Unit tests for the error type.

use agent_relay::AppError;

/// Display output carries the variant prefix and message.
#[test]
fn display_formats_are_stable() {
    let cases = [
        (AppError::Config("bad field".into()), "config: bad field"),
        (AppError::Parse("malformed json".into()), "parse: malformed json"),
        (AppError::Control("denied".into()), "control: denied"),
        (
            AppError::Process("agent exited with code 2".into()),
            "process: agent exited with code 2",
        ),
        (AppError::Aborted("session aborted".into()), "aborted: session aborted"),
        (AppError::Usage("stream already taken".into()), "usage: stream already taken"),
        (AppError::Io("pipe closed".into()), "io: pipe closed"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

/// Only the abort variant is abort-flavored.
#[test]
fn abort_flavor_detection() {
    assert!(AppError::Aborted("x".into()).is_aborted());
    assert!(!AppError::Process("x".into()).is_aborted());
    assert!(!AppError::Usage("x".into()).is_aborted());
}

/// IO errors convert losslessly.
#[test]
fn io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("pipe closed")));
}
