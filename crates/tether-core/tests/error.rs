//! Tests for error handling

use std::time::Duration;

use tether_core::error::{DebugError, Result};
use tether_core::{Address, ExecutionState};

#[test]
fn test_invalid_state_display()
{
    let error = DebugError::InvalidState {
        operation: "read-memory",
        state: ExecutionState::Running,
    };
    let message = format!("{}", error);
    assert!(message.contains("read-memory"));
    assert!(message.contains("running"));
}

#[test]
fn test_timeout_display_names_duration()
{
    let error = DebugError::Timeout(Duration::from_secs(5));
    let message = format!("{}", error);
    assert!(message.contains("Timed out"));
    assert!(message.contains("5"));
}

#[test]
fn test_unsupported_machine_display()
{
    let error = DebugError::UnsupportedMachine(0x2a);
    let message = format!("{}", error);
    assert!(message.contains("0x2a"));
    assert!(message.contains("machine"));
}

#[test]
fn test_target_fault_display()
{
    let error = DebugError::TargetFault {
        code: 12345,
        operation: "write-memory",
    };
    let message = format!("{}", error);
    assert!(message.contains("12345"));
    assert!(message.contains("write-memory"));
}

#[test]
fn test_breakpoint_errors_name_address()
{
    let message = format!("{}", DebugError::NoBreakpoint(Address::new(0x4000_2000)));
    assert!(message.contains("0x0000000040002000"));
    let message = format!("{}", DebugError::BreakpointExists(Address::new(0x4000_2000)));
    assert!(message.contains("already"));
}

#[test]
fn test_fatal_classification()
{
    assert!(DebugError::Connection("reset".to_string()).is_fatal());
    assert!(DebugError::Closed.is_fatal());
    assert!(DebugError::Detached.is_fatal());
    assert!(DebugError::Desync(3).is_fatal());

    assert!(!DebugError::Timeout(Duration::from_secs(1)).is_fatal());
    assert!(!DebugError::TargetFault {
        code: 1,
        operation: "read-memory",
    }
    .is_fatal());
    assert!(!DebugError::InvalidState {
        operation: "step",
        state: ExecutionState::Running,
    }
    .is_fatal());
}

#[test]
fn test_wire_error_converts()
{
    let wire = tether_protocol::WireError::BadMagic(0x1234);
    let error: DebugError = wire.into();
    match error {
        DebugError::Wire(_) => {}
        _ => panic!("Expected Wire variant"),
    }
}

#[test]
fn test_result_type()
{
    // Test that Result type is properly aliased
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(DebugError::Detached);
}
