//! End-to-end tests of the cooperative profile: one engine, polled by hand,
//! talking to a scripted serial port.

use core::str::FromStr;

use atmux::RawMutex;
use atmux::engine::{AtConfig, AtEngine};
use atmux::error::Error;
use atmux::fake_modem::FakeSerial;
use atmux::response::{AtOutcome, CmdReport, RECV_BUF_SIZE};
use atmux::urc::UrcEntry;
use atmux::work::{AtCmd, AtEnv, WorkStep};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};
use heapless::String;

type Report = (AtOutcome, String<RECV_BUF_SIZE>);
type ReportChannel = Channel<RawMutex, Report, 4>;

fn report(channel: &ReportChannel, r: &CmdReport) {
    let recv = String::from_str(r.text()).unwrap();
    channel.try_send((r.outcome, recv)).unwrap();
}

/// Polls `engine` with a 1 ms cadence until `done` or `budget` runs out.
fn pump(engine: &mut AtEngine<FakeSerial>, mut done: impl FnMut() -> bool, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        engine.poll();
        if done() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    false
}

static SIMPLE_OK: ReportChannel = Channel::new();

fn simple_ok_cb(r: &CmdReport) {
    report(&SIMPLE_OK, r);
}

#[test]
fn test_single_line_ok() {
    let _ = env_logger::builder().is_test(true).try_init();
    let serial = FakeSerial::new(&[("AT\r\n", "\r\nAT\r\nOK\r\n")]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_single_line(Some(simple_ok_cb), "AT").unwrap();
    assert!(pump(&mut engine, || !SIMPLE_OK.is_empty(), Duration::from_secs(2)));

    let (outcome, recv) = SIMPLE_OK.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
    assert!(recv.contains("OK"));
}

static RETRIED: ReportChannel = Channel::new();

fn retried_cb(r: &CmdReport) {
    assert_eq!(r.param, 7);
    report(&RETRIED, r);
}

static CSQ_CMD: AtCmd = AtCmd {
    sender: |env| env.send_line("AT+CSQ"),
    matcher: "OK",
    cb: Some(retried_cb),
    retry: 2,
    timeout: Duration::from_millis(3000),
};

#[test]
fn test_cmd_retries_after_error() {
    let serial = FakeSerial::new(&[
        ("AT+CSQ\r\n", "\r\nERROR\r\n"),
        ("AT+CSQ\r\n", "\r\nOK\r\n"),
    ]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    let start = Instant::now();
    engine.submit_cmd(7, &CSQ_CMD).unwrap();
    assert!(pump(&mut engine, || !RETRIED.is_empty(), Duration::from_secs(3)));

    let (outcome, _) = RETRIED.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
    // One back-off period between the two attempts.
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert_eq!(engine.transport_mut().written().matches("AT+CSQ\r\n").count(), 2);
}

static TIMED_OUT: ReportChannel = Channel::new();

fn timed_out_cb(r: &CmdReport) {
    report(&TIMED_OUT, r);
}

static SLOW_CMD: AtCmd = AtCmd {
    sender: |env| env.send_line("AT+SLOW"),
    matcher: "OK",
    cb: Some(timed_out_cb),
    retry: 1,
    timeout: Duration::from_millis(100),
};

#[test]
fn test_cmd_timeout() {
    let serial = FakeSerial::new(&[]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    let start = Instant::now();
    engine.submit_cmd(0, &SLOW_CMD).unwrap();
    assert!(pump(&mut engine, || !TIMED_OUT.is_empty(), Duration::from_secs(2)));

    let (outcome, _) = TIMED_OUT.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

static CMT_URC: Channel<RawMutex, String<128>, 4> = Channel::new();

fn cmt_handler(line: &str) {
    CMT_URC.try_send(String::from_str(line).unwrap()).unwrap();
}

static CMT_TABLE: [UrcEntry; 1] = [UrcEntry {
    prefix: "+CMT:",
    handler: cmt_handler,
}];

#[test]
fn test_urc_during_quiet() {
    let serial = FakeSerial::new(&[]);
    let cfg = AtConfig {
        urc_table: &CMT_TABLE,
        ..Default::default()
    };
    let mut engine = AtEngine::new(serial, cfg);

    engine.transport_mut().inject("\r\n+CMT: \"+123\",,\"25/01/01\"\r\n");
    assert!(pump(&mut engine, || !CMT_URC.is_empty(), Duration::from_secs(1)));
    assert_eq!(CMT_URC.try_receive().unwrap(), "+CMT: \"+123\",,\"25/01/01\"");

    // Exactly once.
    assert!(!pump(&mut engine, || !CMT_URC.is_empty(), Duration::from_millis(50)));
}

static INTERLEAVED: ReportChannel = Channel::new();

fn interleaved_cb(r: &CmdReport) {
    report(&INTERLEAVED, r);
}

static CMT_TABLE2: [UrcEntry; 1] = [UrcEntry {
    prefix: "+CMT:",
    handler: cmt2_handler,
}];

static CMT_URC2: Channel<RawMutex, String<128>, 4> = Channel::new();

fn cmt2_handler(line: &str) {
    CMT_URC2.try_send(String::from_str(line).unwrap()).unwrap();
}

#[test]
fn test_urc_interleaved_with_response() {
    let serial = FakeSerial::new(&[("AT+CSQ\r\n", "\r\n+CMT: x\r\n+CSQ: 20,0\r\nOK\r\n")]);
    let cfg = AtConfig {
        urc_table: &CMT_TABLE2,
        ..Default::default()
    };
    let mut engine = AtEngine::new(serial, cfg);

    engine.submit_single_line(Some(interleaved_cb), "AT+CSQ").unwrap();
    assert!(pump(&mut engine, || !INTERLEAVED.is_empty(), Duration::from_secs(2)));

    assert_eq!(CMT_URC2.try_receive().unwrap(), "+CMT: x");
    assert!(CMT_URC2.is_empty());
    let (outcome, recv) = INTERLEAVED.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
    assert!(recv.contains("+CSQ: 20,0"));
    assert!(recv.contains("OK"));
}

static ABORTED: ReportChannel = Channel::new();

fn aborted_cb(r: &CmdReport) {
    report(&ABORTED, r);
}

#[test]
fn test_suspend_aborts_current_item() {
    let serial = FakeSerial::new(&[("AT\r\n", "\r\nOK\r\n")]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_single_line(Some(aborted_cb), "AT+LONGOP").unwrap();
    assert!(!pump(&mut engine, || !ABORTED.is_empty(), Duration::from_millis(50)));

    engine.suspend();
    assert!(pump(&mut engine, || !ABORTED.is_empty(), Duration::from_millis(50)));
    let (outcome, _) = ABORTED.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Abort);

    // After resuming, the channel works again.
    engine.resume();
    engine.submit_single_line(Some(aborted_cb), "AT").unwrap();
    assert!(pump(&mut engine, || !ABORTED.is_empty(), Duration::from_secs(2)));
    let (outcome, _) = ABORTED.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
}

static FIFO: Channel<RawMutex, u8, 4> = Channel::new();

fn fifo_first(_r: &CmdReport) {
    FIFO.try_send(1).unwrap();
}

fn fifo_second(_r: &CmdReport) {
    FIFO.try_send(2).unwrap();
}

#[test]
fn test_items_complete_in_submission_order() {
    let serial = FakeSerial::new(&[("AT\r\n", "\r\nOK\r\n"), ("ATI\r\n", "\r\nOK\r\n")]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_single_line(Some(fifo_first), "AT").unwrap();
    engine.submit_single_line(Some(fifo_second), "ATI").unwrap();
    assert!(pump(&mut engine, || FIFO.len() == 2, Duration::from_secs(2)));

    assert_eq!(FIFO.try_receive().unwrap(), 1);
    assert_eq!(FIFO.try_receive().unwrap(), 2);
}

#[test]
fn test_submission_fails_when_pool_is_full() {
    let serial = FakeSerial::new(&[]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    for _ in 0..atmux::work::WORK_POOL_SIZE {
        engine.submit_single_line(None, "AT").unwrap();
    }
    assert_eq!(
        engine.submit_single_line(None, "AT").unwrap_err(),
        Error::QueueFull
    );
}

static BATCH: ReportChannel = Channel::new();

fn batch_cb(r: &CmdReport) {
    report(&BATCH, r);
}

#[test]
fn test_multi_line_runs_all_commands() {
    let serial = FakeSerial::new(&[
        ("ATE0\r\n", "\r\nOK\r\n"),
        ("AT+CMGF=1\r\n", "\r\nOK\r\n"),
        ("AT+CNMI=2,2\r\n", "\r\nOK\r\n"),
    ]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine
        .submit_multi_line(Some(batch_cb), &["ATE0", "AT+CMGF=1", "AT+CNMI=2,2"])
        .unwrap();
    assert!(pump(&mut engine, || !BATCH.is_empty(), Duration::from_secs(2)));

    let (outcome, _) = BATCH.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
    assert!(engine.transport_mut().script_done());
}

static BATCH_ERR: ReportChannel = Channel::new();

fn batch_err_cb(r: &CmdReport) {
    report(&BATCH_ERR, r);
}

#[test]
fn test_multi_line_gives_up_after_three_errors() {
    let serial = FakeSerial::new(&[
        ("ATE0\r\n", "\r\nOK\r\n"),
        ("AT+BAD\r\n", "\r\nERROR\r\n"),
        ("AT+BAD\r\n", "\r\nERROR\r\n"),
        ("AT+BAD\r\n", "\r\nERROR\r\n"),
    ]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_multi_line(Some(batch_err_cb), &["ATE0", "AT+BAD"]).unwrap();
    assert!(pump(&mut engine, || !BATCH_ERR.is_empty(), Duration::from_secs(5)));

    let (outcome, _) = BATCH_ERR.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Error);
    assert_eq!(engine.transport_mut().written().matches("ATE0\r\n").count(), 1);
    assert_eq!(engine.transport_mut().written().matches("AT+BAD\r\n").count(), 3);
}

static MATCHER_WINS: ReportChannel = Channel::new();

fn matcher_wins_cb(r: &CmdReport) {
    report(&MATCHER_WINS, r);
}

static AMBIGUOUS_CMD: AtCmd = AtCmd {
    sender: |env| env.send_line("AT+COPS?"),
    matcher: "OK",
    cb: Some(matcher_wins_cb),
    retry: 1,
    timeout: Duration::from_millis(3000),
};

#[test]
fn test_matcher_beats_error_in_same_observation() {
    // Both markers are in the buffer at classification time; the success
    // matcher is tested first.
    let serial = FakeSerial::new(&[("AT+COPS?\r\n", "\r\nERROR\r\nOK\r\n")]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_cmd(0, &AMBIGUOUS_CMD).unwrap();
    assert!(pump(&mut engine, || !MATCHER_WINS.is_empty(), Duration::from_secs(2)));
    let (outcome, _) = MATCHER_WINS.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Ok);
}

static QUEUE_ABORT: ReportChannel = Channel::new();

fn queue_abort_cb(r: &CmdReport) {
    report(&QUEUE_ABORT, r);
}

#[test]
fn test_abort_work_before_it_starts() {
    let serial = FakeSerial::new(&[]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    let handle = engine.submit_single_line(Some(queue_abort_cb), "AT").unwrap();
    engine.abort_work(handle);
    assert!(pump(&mut engine, || !QUEUE_ABORT.is_empty(), Duration::from_millis(200)));

    let (outcome, _) = QUEUE_ABORT.try_receive().unwrap();
    assert_eq!(outcome, AtOutcome::Abort);
    // The aborted item never reached the modem.
    assert_eq!(engine.transport_mut().written(), "");
}

static SMS_RESULT: Channel<RawMutex, AtOutcome, 1> = Channel::new();

fn sms_work(env: &mut AtEnv) -> WorkStep {
    match env.vars.state {
        0 => {
            env.send_line("AT+CMGS=\"+421901234567\"");
            env.reset_timer();
            env.vars.state = 1;
            WorkStep::Pending
        }
        1 => {
            if env.find("> ") {
                env.recv_clear();
                env.send_raw(b"hello\x1a");
                env.reset_timer();
                env.vars.state = 2;
                WorkStep::Pending
            } else if env.is_timeout(Duration::from_millis(1000)) {
                SMS_RESULT.try_send(AtOutcome::Timeout).unwrap();
                WorkStep::Done(AtOutcome::Timeout)
            } else {
                WorkStep::Pending
            }
        }
        _ => {
            if env.find("OK") {
                SMS_RESULT.try_send(AtOutcome::Ok).unwrap();
                WorkStep::Done(AtOutcome::Ok)
            } else if env.is_timeout(Duration::from_millis(1000)) {
                SMS_RESULT.try_send(AtOutcome::Timeout).unwrap();
                WorkStep::Done(AtOutcome::Timeout)
            } else {
                WorkStep::Pending
            }
        }
    }
}

#[test]
fn test_script_work_drives_prompt_exchange() {
    let serial = FakeSerial::new(&[
        ("AT+CMGS=\"+421901234567\"\r\n", "\r\n> "),
        ("hello\x1a", "\r\n+CMGS: 12\r\nOK\r\n"),
    ]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_work(0, sms_work).unwrap();
    assert!(pump(&mut engine, || !SMS_RESULT.is_empty(), Duration::from_secs(3)));
    assert_eq!(SMS_RESULT.try_receive().unwrap(), AtOutcome::Ok);
    assert!(engine.transport_mut().script_done());
}

#[test]
fn test_busy_while_work_is_queued() {
    let serial = FakeSerial::new(&[("AT\r\n", "\r\nOK\r\n")]);
    let mut engine = AtEngine::new(serial, AtConfig::default());

    engine.submit_single_line(None, "AT").unwrap();
    assert!(engine.busy());

    // Still busy right after completion: response bytes count as recent URC traffic.
    pump(&mut engine, || false, Duration::from_millis(50));
    assert!(engine.busy());
}
