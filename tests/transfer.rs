use common::{Device, SimulatedDevice, RAM_BASE};
use lpcflash::{
    connection::{Connection, ConnectionConfig},
    error::Error,
    progress::ProgressCallbacks,
    transfer::{read_memory, write_to_ram, Encoding, MAX_RESENDS},
};
use pretty_assertions::assert_eq;

mod common;

fn open(device: Device) -> (SimulatedDevice, Connection) {
    let sim = SimulatedDevice::new(device);
    let mut connection = Connection::new(sim.transport(), ConnectionConfig::default());
    connection.assume_synchronized();

    (sim, connection)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

#[derive(Default)]
struct Recorder {
    init: Option<(u32, usize)>,
    updates: Vec<usize>,
    finished: bool,
}

impl ProgressCallbacks for Recorder {
    fn init(&mut self, addr: u32, total: usize) {
        self.init = Some((addr, total));
    }

    fn update(&mut self, current: usize) {
        self.updates.push(current);
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

#[test]
fn read_survives_three_corrupted_blocks() {
    let mut device = Device::synchronized();
    device.flash[..2048].copy_from_slice(&pattern(2048));
    device.corrupt_read_blocks = MAX_RESENDS;
    let (sim, mut connection) = open(device);

    let data = read_memory(&mut connection, 0, 2048, Encoding::Uuencoded, None).unwrap();

    assert_eq!(data, pattern(2048));
    assert_eq!(sim.device().resends_received, 3);
    assert!(sim.device().is_idle());
}

#[test]
fn read_gives_up_on_fourth_corrupted_block() {
    let mut device = Device::synchronized();
    device.corrupt_read_blocks = MAX_RESENDS + 1;
    let (sim, mut connection) = open(device);

    let result = read_memory(&mut connection, 0, 2048, Encoding::Uuencoded, None);

    assert!(matches!(
        result,
        Err(Error::BlockChecksum {
            block: 0,
            attempts: 4
        })
    ));
    assert_eq!(sim.device().resends_received, 3);
}

#[test]
fn garbled_checksum_line_is_a_mismatch() {
    let mut device = Device::synchronized();
    device.flash[..2048].copy_from_slice(&pattern(2048));
    device.garbled_read_checksums = 1;
    let (sim, mut connection) = open(device);

    let data = read_memory(&mut connection, 0, 2048, Encoding::Uuencoded, None).unwrap();

    assert_eq!(data, pattern(2048));
    assert_eq!(sim.device().resends_received, 1);
    assert!(sim.device().is_idle());
}

#[test]
fn undecodable_block_is_a_mismatch() {
    let mut device = Device::synchronized();
    device.flash[..2048].copy_from_slice(&pattern(2048));
    device.undecodable_read_blocks = 2;
    let (sim, mut connection) = open(device);

    let data = read_memory(&mut connection, 0, 2048, Encoding::Uuencoded, None).unwrap();

    assert_eq!(data, pattern(2048));
    assert_eq!(sim.device().resends_received, 2);
}

#[test]
fn write_survives_three_rejected_blocks() {
    let mut device = Device::synchronized();
    device.corrupt_write_blocks = MAX_RESENDS;
    let (sim, mut connection) = open(device);

    write_to_ram(&mut connection, RAM_BASE + 0x800, &pattern(1024), Encoding::Uuencoded).unwrap();

    let device = sim.device();
    assert_eq!(&device.ram[0x800..0xC00], &pattern(1024)[..]);
    assert_eq!(device.resends_sent, 3);
    assert!(device.is_idle());
}

#[test]
fn write_gives_up_on_fourth_rejected_block() {
    let mut device = Device::synchronized();
    device.corrupt_write_blocks = MAX_RESENDS + 1;
    let (sim, mut connection) = open(device);

    let result = write_to_ram(&mut connection, RAM_BASE, &pattern(1024), Encoding::Uuencoded);

    assert!(matches!(
        result,
        Err(Error::BlockChecksum {
            block: 0,
            attempts: 4
        })
    ));
    assert_eq!(sim.device().resends_sent, 4);
}

#[test]
fn uuencoded_transfers_of_various_lengths() {
    let (_sim, mut connection) = open(Device::synchronized());

    for len in [4, 44, 48, 900, 904, 2000] {
        let data = pattern(len);
        write_to_ram(&mut connection, RAM_BASE, &data, Encoding::Uuencoded).unwrap();

        let read = read_memory(
            &mut connection,
            RAM_BASE,
            len as u32,
            Encoding::Uuencoded,
            None,
        )
        .unwrap();
        assert_eq!(read, data, "transfer of {len} bytes");
    }
}

#[test]
fn raw_transfers() {
    let mut device = Device::synchronized();
    device.uuencode = false;
    let (sim, mut connection) = open(device);

    write_to_ram(&mut connection, RAM_BASE + 0x100, &pattern(64), Encoding::Raw).unwrap();
    let read = read_memory(&mut connection, RAM_BASE + 0x100, 64, Encoding::Raw, None).unwrap();

    assert_eq!(read, pattern(64));
    assert_eq!(
        sim.device().commands,
        vec!["W 268435712 64".to_string(), "R 268435712 64".to_string()]
    );
}

#[test]
fn read_reports_progress_per_block() {
    let (_sim, mut connection) = open(Device::synchronized());
    let mut recorder = Recorder::default();

    read_memory(
        &mut connection,
        0,
        2000,
        Encoding::Uuencoded,
        Some(&mut recorder),
    )
    .unwrap();

    assert_eq!(recorder.init, Some((0, 2000)));
    assert_eq!(recorder.updates, vec![900, 1800, 2000]);
    assert!(recorder.finished);
}

#[test]
fn misaligned_transfers_are_refused_before_sending() {
    let (sim, mut connection) = open(Device::synchronized());

    assert!(matches!(
        read_memory(&mut connection, 2, 4, Encoding::Uuencoded, None),
        Err(Error::Misaligned { value: 2, .. })
    ));
    assert!(matches!(
        write_to_ram(&mut connection, RAM_BASE, &[1, 2, 3], Encoding::Uuencoded),
        Err(Error::Misaligned { value: 3, .. })
    ));
    assert!(sim.device().commands.is_empty());
}

#[test]
fn status_errors_are_reported_with_the_command() {
    let (_sim, mut connection) = open(Device::synchronized());

    // neither flash nor RAM
    let result = read_memory(&mut connection, 0x2000_0000, 4, Encoding::Uuencoded, None);

    match result {
        Err(Error::Status(err)) => {
            assert_eq!(err.to_string(), "The read-memory command failed with status 14 (ADDR_NOT_MAPPED)");
        }
        other => panic!("unexpected result {other:?}"),
    }
}
