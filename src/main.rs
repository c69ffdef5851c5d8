#![no_std]
#![no_main]

extern crate alloc;

// Required for ESP-IDF bootloader compatibility
// Use explicit parameters to ensure correct efuse block revision values
esp_bootloader_esp_idf::esp_app_desc!(
    env!("CARGO_PKG_VERSION"),  // version
    env!("CARGO_PKG_NAME"),     // project_name
    "00:00:00",                 // build_time
    "2025-01-01",               // build_date
    "0.0.0",                    // idf_ver (not using IDF)
    0x10000,                    // mmu_page_size (64KB)
    0,                          // min_efuse_blk_rev_full (accept all)
    u16::MAX                    // max_efuse_blk_rev_full (accept all)
);

use embassy_executor::Spawner;
use esp_backtrace as _;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::spi::Mode as SpiMode;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Async;
use esp_storage::FlashStorage;
use static_cell::StaticCell;

use field_link_firmware::debug;
use field_link_firmware::lora::driver::{Sx1262Driver, Sx1262Pins};
use field_link_firmware::provision::{NodeConfig, ProvisionError, Role};
use field_link_firmware::security::SecurityConfig;
use field_link_firmware::session::{BaseSession, RemoteSession, ResetRecord, SessionConfig};
use field_link_firmware::storage::SlotStorage;
use field_link_firmware::tasks;
use field_link_firmware::transfer::{Backoff, Endpoint, TransferConfig};

type Radio = Sx1262Driver<Spi<'static, Async>, Output<'static>, Input<'static>, Output<'static>, Input<'static>>;

type Flash = SlotStorage<FlashStorage<'static>>;

/// Static executor for embassy
static EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

#[esp_hal::main]
fn main() -> ! {
    // Frame codec, archive records and queued commands allocate
    esp_alloc::heap_allocator!(size: 48 * 1024);

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // LED off until commanded (active low)
    let led = Output::new(peripherals.GPIO48, Level::High, OutputConfig::default());

    // Initialise the RTOS scheduler with timer - MUST be done before any async operations
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    debug::init(log::LevelFilter::Info);

    // Configure SPI for LoRa
    let spi = Spi::new(
        peripherals.SPI2,
        SpiConfig::default()
            .with_frequency(Rate::from_mhz(1))
            .with_mode(SpiMode::_0),
    )
    .unwrap()
    .with_sck(peripherals.GPIO7)
    .with_miso(peripherals.GPIO8)
    .with_mosi(peripherals.GPIO9)
    .into_async();

    // Configure LoRa control pins
    let lora_pins = Sx1262Pins {
        nss: Output::new(peripherals.GPIO41, Level::High, OutputConfig::default()),
        dio1: Input::new(peripherals.GPIO39, InputConfig::default().with_pull(Pull::Down)),
        nrst: Output::new(peripherals.GPIO42, Level::High, OutputConfig::default()),
        busy: Input::new(peripherals.GPIO40, InputConfig::default().with_pull(Pull::Down)),
    };
    let radio = Sx1262Driver::new(spi, lora_pins);

    let storage = SlotStorage::with_default_layout(FlashStorage::new(peripherals.FLASH));

    // Hardware RNG decorrelates backoff between nodes that collided
    let mut rng = esp_hal::rng::Rng::new();
    let seed = ((rng.random() as u64) << 32) | rng.random() as u64;

    let executor = EXECUTOR.init(esp_rtos::embassy::Executor::new());
    executor.run(|spawner| {
        spawner.must_spawn(async_main(spawner, radio, led, storage, seed));
    })
}

#[embassy_executor::task]
async fn async_main(spawner: Spawner, radio: Radio, led: Output<'static>, mut storage: Flash, seed: u64) {
    spawner.must_spawn(log_writer_task());
    spawner.must_spawn(led_task(led));
    spawner.must_spawn(admin_task());

    if let Ok(Some(record)) = ResetRecord::load(&mut storage) {
        log::warn!(
            "boot: {} failure resets so far, last: {}",
            record.reboot_count,
            record.last_error
        );
    }

    if let Err(e) = start_session(spawner, radio, storage, seed) {
        // Radio stays off; the LED and admin tasks keep running
        log::error!("boot: {}", e);
    }
}

fn start_session(spawner: Spawner, radio: Radio, mut storage: Flash, seed: u64) -> Result<(), ProvisionError> {
    let node = NodeConfig::load(&mut storage)?;
    let keyring = node.keyring(&mut storage)?;
    let endpoint = Endpoint::load(&node.unit_id, SecurityConfig::default(), keyring, storage)?;

    let now = embassy_time::Instant::now().as_millis();
    let backoff = Backoff::with_defaults(seed);

    match node.role {
        Role::Remote => {
            let registry = tasks::device_registry().map_err(|_| ProvisionError::Invalid)?;
            let base_id = node.base_id.as_deref().ok_or(ProvisionError::Invalid)?;
            let session = RemoteSession::new(
                base_id,
                SessionConfig::default(),
                TransferConfig::default(),
                endpoint,
                registry,
                backoff,
                now,
            )?;
            log::info!("boot: remote {} reporting to {}", node.unit_id, base_id);
            spawner.must_spawn(remote_task(radio, session));
        }
        Role::Base => {
            let session = BaseSession::new(
                SessionConfig::default(),
                TransferConfig::default(),
                endpoint,
                backoff,
                now,
            )?;
            log::info!("boot: base {}", node.unit_id);
            spawner.must_spawn(base_task(radio, session));
        }
    }
    Ok(())
}

#[embassy_executor::task]
async fn log_writer_task() {
    debug::log_writer_task().await;
}

#[embassy_executor::task]
async fn led_task(led: Output<'static>) {
    tasks::led_task(led, tasks::LED_CHANNEL.receiver()).await;
}

#[embassy_executor::task]
async fn admin_task() {
    tasks::admin_task(tasks::ADMIN_CHANNEL.receiver()).await;
}

#[embassy_executor::task]
async fn remote_task(radio: Radio, session: RemoteSession<Flash>) {
    tasks::remote_task(radio, session).await;
}

#[embassy_executor::task]
async fn base_task(radio: Radio, session: BaseSession<Flash>) {
    tasks::base_task(radio, session).await;
}
