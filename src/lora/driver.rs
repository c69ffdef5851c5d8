//! SX1262 LoRa driver
//!
//! Drives the modem over SPI with manual NSS control and implements
//! [`RadioTransport`] for the embassy executor. Channel activity detection
//! uses the modem's CAD mode; `deinit` puts it into warm-start sleep.

use crate::config::protocol::MAX_LORA_PAYLOAD;
use crate::config::tcxo;
use crate::lora::traits::{ChannelState, LoraConfig, RadioError, RadioTransport, RxPacket};
use embassy_time::{Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::spi::SpiBus;
use heapless::Vec;

/// SX1262 command opcodes
mod cmd {
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_TX: u8 = 0x83;
    pub const SET_RX: u8 = 0x82;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const SET_PACKET_TYPE: u8 = 0x8A;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PACKET_PARAMS: u8 = 0x8C;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const SET_PA_CONFIG: u8 = 0x95;
    pub const SET_DIO3_AS_TCXO_CTRL: u8 = 0x97;
    pub const SET_DIO2_AS_RF_SWITCH_CTRL: u8 = 0x9D;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const WRITE_BUFFER: u8 = 0x0E;
    pub const READ_BUFFER: u8 = 0x1E;
    pub const WRITE_REGISTER: u8 = 0x0D;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x13;
    pub const GET_PACKET_STATUS: u8 = 0x14;
    pub const GET_IRQ_STATUS: u8 = 0x12;
    pub const CLEAR_IRQ_STATUS: u8 = 0x02;
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x08;
    pub const SET_SLEEP: u8 = 0x84;
    pub const SET_CAD_PARAMS: u8 = 0x88;
    pub const SET_CAD: u8 = 0xC5;
    pub const GET_RSSI_INST: u8 = 0x15;
}

/// SX1262 register addresses
mod reg {
    /// Over-current protection register
    pub const OCP_CONFIGURATION: u16 = 0x08E7;
}

mod standby {
    pub const STDBY_RC: u8 = 0x00;
}

/// Packet types
mod packet_type {
    pub const LORA: u8 = 0x01;
}

/// IRQ masks
mod irq {
    pub const TX_DONE: u16 = 0x0001;
    pub const RX_DONE: u16 = 0x0002;
    pub const TIMEOUT: u16 = 0x0200;
    pub const CRC_ERR: u16 = 0x0040;
    pub const CAD_DONE: u16 = 0x0080;
    pub const CAD_DETECTED: u16 = 0x0100;
}

/// CAD tuning for SF9/125 kHz (datasheet table 13-71)
mod cad {
    /// Four symbols
    pub const SYMBOL_NUM: u8 = 0x02;
    pub const DET_PEAK: u8 = 23;
    pub const DET_MIN: u8 = 10;
    /// Return to standby after detection
    pub const EXIT_ONLY: u8 = 0x00;
    /// CAD on four SF9 symbols takes about 17 ms
    pub const TIMEOUT_MS: u32 = 100;
}

/// Warm start keeps the configuration retained during sleep
const SLEEP_WARM_START: u8 = 0x04;

/// TCXO start-up allowance in 15.625 us steps (5 ms)
const TCXO_STARTUP_STEPS: u32 = 0x000140;
const OCP_LIMIT_MA: u16 = 140;
const PREAMBLE_SYMBOLS: u16 = 8;
const TX_BASE: u8 = 0x00;
const RX_BASE: u8 = 0x80;
const TX_TIMEOUT_MS: u32 = 10_000;
const RX_CONTINUOUS: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Bandwidth register codes by nominal kHz (fractional bands round either way)
const BANDWIDTHS: [(core::ops::RangeInclusive<u32>, u8); 10] = [
    (7..=8, 0x00),
    (10..=10, 0x08),
    (15..=16, 0x01),
    (20..=21, 0x09),
    (31..=31, 0x02),
    (41..=42, 0x0A),
    (62..=63, 0x03),
    (125..=125, 0x04),
    (250..=250, 0x05),
    (500..=500, 0x06),
];

/// Low-level failures, folded into [`RadioError`] at the trait boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverError {
    BusyTimeout,
    Spi,
    Timeout,
    Crc,
    ReceiveFailed,
    TransmitFailed,
}

impl From<DriverError> for RadioError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::BusyTimeout | DriverError::Spi => RadioError::Hardware,
            DriverError::Timeout => RadioError::Timeout,
            DriverError::Crc => RadioError::CrcMismatch,
            DriverError::ReceiveFailed | DriverError::TransmitFailed => RadioError::Transient,
        }
    }
}

/// Control pins for SX1262
pub struct Sx1262Pins<Nss, Dio1, Nrst, Busy> {
    pub nss: Nss,
    pub dio1: Dio1,
    pub nrst: Nrst,
    pub busy: Busy,
}

/// SX1262 LoRa driver
///
/// SPI bus and GPIO pins are injected so the same driver serves any board
/// wiring the module the WIO-SX1262 way.
pub struct Sx1262Driver<Spi, Nss, Dio1, Nrst, Busy>
where
    Spi: SpiBus,
    Nss: OutputPin,
    Dio1: InputPin,
    Nrst: OutputPin,
    Busy: InputPin,
{
    spi: Spi,
    nss: Nss,
    dio1: Dio1,
    nrst: Nrst,
    busy: Busy,
    initialised: bool,
    config: Option<LoraConfig>,
}

impl<Spi, Nss, Dio1, Nrst, Busy> Sx1262Driver<Spi, Nss, Dio1, Nrst, Busy>
where
    Spi: SpiBus,
    Nss: OutputPin,
    Dio1: InputPin,
    Nrst: OutputPin,
    Busy: InputPin,
{
    /// Create a new SX1262 driver
    pub fn new(spi: Spi, pins: Sx1262Pins<Nss, Dio1, Nrst, Busy>) -> Self {
        Self {
            spi,
            nss: pins.nss,
            dio1: pins.dio1,
            nrst: pins.nrst,
            busy: pins.busy,
            initialised: false,
            config: None,
        }
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        let _ = self.nrst.set_low();
        Timer::after(Duration::from_millis(10)).await;
        let _ = self.nrst.set_high();
        Timer::after(Duration::from_millis(20)).await;
        Ok(())
    }

    /// Poll BUSY for up to 100 ms
    async fn wait_not_busy(&mut self) -> Result<(), DriverError> {
        for _ in 0..1000 {
            if self.busy.is_low().unwrap_or(false) {
                return Ok(());
            }
            Timer::after(Duration::from_micros(100)).await;
        }
        Err(DriverError::BusyTimeout)
    }

    /// One full-duplex exchange framed by NSS; NSS is released even when
    /// the bus fails
    async fn transaction(&mut self, rx: &mut [u8], tx: &[u8]) -> Result<(), DriverError> {
        self.wait_not_busy().await?;
        let _ = self.nss.set_low();
        let result = if rx.is_empty() {
            self.spi.write(tx).await
        } else {
            self.spi.transfer(rx, tx).await
        };
        let _ = self.nss.set_high();
        result.map_err(|_| DriverError::Spi)
    }

    async fn write_command(&mut self, opcode: u8, params: &[u8]) -> Result<(), DriverError> {
        let mut frame = [0u8; 16];
        let len = 1 + params.len().min(frame.len() - 1);
        frame[0] = opcode;
        frame[1..len].copy_from_slice(&params[..len - 1]);
        self.transaction(&mut [], &frame[..len]).await
    }

    /// Run a getter opcode; the reply follows the opcode and a status byte
    async fn read_command<const N: usize>(&mut self, opcode: u8) -> Result<[u8; N], DriverError> {
        let mut tx = [0u8; 18];
        let mut rx = [0u8; 18];
        tx[0] = opcode;
        self.transaction(&mut rx[..2 + N], &tx[..2 + N]).await?;

        let mut reply = [0u8; N];
        reply.copy_from_slice(&rx[2..2 + N]);
        Ok(reply)
    }

    async fn write_register(&mut self, addr: u16, value: u8) -> Result<(), DriverError> {
        let [hi, lo] = addr.to_be_bytes();
        self.write_command(cmd::WRITE_REGISTER, &[hi, lo, value]).await
    }

    async fn set_standby(&mut self) -> Result<(), DriverError> {
        self.write_command(cmd::SET_STANDBY, &[standby::STDBY_RC]).await
    }

    /// Board wiring: TCXO powered from DIO3, RF switch driven by DIO2
    async fn configure_board(&mut self) -> Result<(), DriverError> {
        let [_, t2, t1, t0] = TCXO_STARTUP_STEPS.to_be_bytes();
        self.write_command(cmd::SET_DIO3_AS_TCXO_CTRL, &[tcxo::VOLTAGE_CODE, t2, t1, t0])
            .await?;
        Timer::after(Duration::from_millis(10)).await;
        self.write_command(cmd::SET_DIO2_AS_RF_SWITCH_CTRL, &[0x01]).await?;

        // Over-current limit in 2.5 mA steps
        let ocp = ((OCP_LIMIT_MA as u32 * 10) / 25).min(63) as u8;
        self.write_register(reg::OCP_CONFIGURATION, ocp).await
    }

    async fn set_frequency(&mut self, freq_hz: u32) -> Result<(), DriverError> {
        // Steps of 32 MHz / 2^25
        let steps = ((freq_hz as u64) << 25) / 32_000_000;
        self.write_command(cmd::SET_RF_FREQUENCY, &(steps as u32).to_be_bytes())
            .await
    }

    async fn set_modulation_params(&mut self, config: &LoraConfig) -> Result<(), DriverError> {
        let bw = BANDWIDTHS
            .iter()
            .find(|(khz, _)| khz.contains(&config.bandwidth_khz))
            .map_or(0x04, |&(_, code)| code);
        // 4/5 is code 1 up to 4/8 at code 4
        let cr = config.coding_rate.clamp(5, 8) - 4;
        // Low data rate optimisation for symbols longer than 16 ms
        let ldro = u8::from(config.spreading_factor >= 11 && config.bandwidth_khz <= 125);

        self.write_command(cmd::SET_MODULATION_PARAMS, &[config.spreading_factor, bw, cr, ldro])
            .await
    }

    /// Explicit header, CRC on, standard IQ and an 8-symbol preamble
    async fn set_packet_params(&mut self, payload_len: u8) -> Result<(), DriverError> {
        let [p1, p0] = PREAMBLE_SYMBOLS.to_be_bytes();
        self.write_command(cmd::SET_PACKET_PARAMS, &[p1, p0, 0x00, payload_len, 0x01, 0x00])
            .await
    }

    /// High-power PA setup followed by the output level; PA config must
    /// precede SetTxParams
    async fn set_tx_power(&mut self, power_dbm: i8) -> Result<(), DriverError> {
        self.write_command(cmd::SET_PA_CONFIG, &[0x04, 0x07, 0x00, 0x01]).await?;
        // Two's complement dBm, 200 us ramp
        self.write_command(cmd::SET_TX_PARAMS, &[power_dbm as u8, 0x04]).await
    }

    /// Route `mask` to DIO1 and clear anything pending
    async fn arm_irq(&mut self, mask: u16) -> Result<(), DriverError> {
        let [hi, lo] = mask.to_be_bytes();
        self.write_command(cmd::SET_DIO_IRQ_PARAMS, &[hi, lo, hi, lo, 0, 0, 0, 0])
            .await?;
        self.clear_irq().await
    }

    async fn clear_irq(&mut self) -> Result<(), DriverError> {
        self.write_command(cmd::CLEAR_IRQ_STATUS, &[0xFF, 0xFF]).await
    }

    async fn write_buffer(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let mut tx = [0u8; 2 + MAX_LORA_PAYLOAD];
        let len = data.len().min(MAX_LORA_PAYLOAD);
        tx[0] = cmd::WRITE_BUFFER;
        tx[1] = TX_BASE;
        tx[2..2 + len].copy_from_slice(&data[..len]);
        self.transaction(&mut [], &tx[..2 + len]).await
    }

    /// Copy the last received packet out of the modem's FIFO
    async fn read_packet(&mut self) -> Result<Vec<u8, MAX_LORA_PAYLOAD>, DriverError> {
        let [len, offset] = self.read_command::<2>(cmd::GET_RX_BUFFER_STATUS).await?;
        let len = len as usize;

        // Opcode, offset and a status byte precede the data
        let mut tx = [0u8; 3 + 256];
        let mut rx = [0u8; 3 + 256];
        tx[0] = cmd::READ_BUFFER;
        tx[1] = offset;
        self.transaction(&mut rx[..3 + len], &tx[..3 + len]).await?;

        Vec::from_slice(&rx[3..3 + len]).map_err(|_| DriverError::ReceiveFailed)
    }

    /// RSSI in dBm and SNR in dB of the last packet
    async fn packet_status(&mut self) -> Result<(i16, i8), DriverError> {
        let [rssi, snr, _] = self.read_command::<3>(cmd::GET_PACKET_STATUS).await?;
        Ok((-(rssi as i16) / 2, (snr as i8) / 4))
    }

    /// Wait for DIO1 interrupt with timeout
    async fn wait_for_irq(&mut self, timeout_ms: u32) -> Result<u16, DriverError> {
        let deadline = embassy_time::Instant::now() + Duration::from_millis(timeout_ms as u64);

        loop {
            if self.dio1.is_high().unwrap_or(false) {
                let status = self.read_command::<2>(cmd::GET_IRQ_STATUS).await?;
                self.clear_irq().await?;
                return Ok(u16::from_be_bytes(status));
            }

            if embassy_time::Instant::now() >= deadline {
                return Err(DriverError::Timeout);
            }

            Timer::after(Duration::from_micros(100)).await;
        }
    }

    /// Leave the modem listening between operations
    async fn start_receive_mode(&mut self) -> Result<(), DriverError> {
        self.set_standby().await?;
        self.set_packet_params(MAX_LORA_PAYLOAD as u8).await?;
        self.arm_irq(irq::RX_DONE | irq::TIMEOUT | irq::CRC_ERR).await?;
        self.write_command(cmd::SET_RX, &RX_CONTINUOUS).await
    }

    async fn bring_up(&mut self) -> Result<(), DriverError> {
        self.reset().await?;
        self.wait_not_busy().await?;
        self.set_standby().await?;
        self.configure_board().await?;
        self.write_command(cmd::SET_PACKET_TYPE, &[packet_type::LORA]).await?;
        self.write_command(cmd::SET_BUFFER_BASE_ADDRESS, &[TX_BASE, RX_BASE])
            .await?;

        let config = self.config.clone().unwrap_or_default();
        self.apply_config(&config).await?;
        self.start_receive_mode().await
    }

    /// Apply modulation settings; kept across sleep and re-init
    pub async fn configure(&mut self, config: &LoraConfig) -> Result<(), RadioError> {
        if !(7..=12).contains(&config.spreading_factor) || !(5..=8).contains(&config.coding_rate) {
            return Err(RadioError::InvalidConfig);
        }
        self.apply_config(config).await?;
        Ok(())
    }

    async fn apply_config(&mut self, config: &LoraConfig) -> Result<(), DriverError> {
        self.set_standby().await?;
        self.set_frequency(config.frequency_hz).await?;
        self.set_modulation_params(config).await?;
        self.set_tx_power(config.tx_power_dbm).await?;
        self.config = Some(config.clone());
        Ok(())
    }

    async fn transmit(&mut self, data: &[u8]) -> Result<(), DriverError> {
        self.set_standby().await?;
        self.set_packet_params(data.len() as u8).await?;
        self.write_buffer(data).await?;
        self.arm_irq(irq::TX_DONE).await?;

        // Timeout 0: the modem never aborts the transmission itself
        self.write_command(cmd::SET_TX, &[0x00, 0x00, 0x00]).await?;
        let status = self.wait_for_irq(TX_TIMEOUT_MS).await?;
        self.start_receive_mode().await?;

        if status & irq::TX_DONE == 0 {
            return Err(DriverError::TransmitFailed);
        }
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u32) -> Result<RxPacket, DriverError> {
        self.set_standby().await?;
        self.set_packet_params(MAX_LORA_PAYLOAD as u8).await?;
        self.arm_irq(irq::RX_DONE | irq::TIMEOUT | irq::CRC_ERR).await?;

        // 15.625 us steps, 24 bits; zero means single-shot without timeout
        let steps = (timeout_ms.saturating_mul(64) / 1000).min(0xFF_FFFF);
        let [_, t2, t1, t0] = steps.to_be_bytes();
        self.write_command(cmd::SET_RX, &[t2, t1, t0]).await?;

        let status = self.wait_for_irq(timeout_ms.saturating_add(1000)).await?;
        if status & irq::TIMEOUT != 0 {
            return Err(DriverError::Timeout);
        }
        if status & irq::CRC_ERR != 0 {
            return Err(DriverError::Crc);
        }
        if status & irq::RX_DONE == 0 {
            return Err(DriverError::ReceiveFailed);
        }

        let data = self.read_packet().await?;
        let (rssi, snr) = self.packet_status().await?;
        Ok(RxPacket { data, rssi, snr })
    }

    /// Listen for a preamble; `Ok(true)` when one was detected
    async fn run_cad(&mut self) -> Result<bool, DriverError> {
        self.set_standby().await?;
        let params = [cad::SYMBOL_NUM, cad::DET_PEAK, cad::DET_MIN, cad::EXIT_ONLY, 0, 0, 0];
        self.write_command(cmd::SET_CAD_PARAMS, &params).await?;
        self.arm_irq(irq::CAD_DONE | irq::CAD_DETECTED).await?;

        self.write_command(cmd::SET_CAD, &[]).await?;
        let status = self.wait_for_irq(cad::TIMEOUT_MS).await?;
        self.start_receive_mode().await?;

        if status & irq::CAD_DONE == 0 {
            return Err(DriverError::ReceiveFailed);
        }
        Ok(status & irq::CAD_DETECTED != 0)
    }

    async fn instant_rssi(&mut self) -> Result<i16, DriverError> {
        let [rssi] = self.read_command::<1>(cmd::GET_RSSI_INST).await?;
        Ok(-(rssi as i16) / 2)
    }
}

impl<Spi, Nss, Dio1, Nrst, Busy> RadioTransport for Sx1262Driver<Spi, Nss, Dio1, Nrst, Busy>
where
    Spi: SpiBus,
    Nss: OutputPin,
    Dio1: InputPin,
    Nrst: OutputPin,
    Busy: InputPin,
{
    async fn init(&mut self) -> Result<(), RadioError> {
        self.initialised = false;
        self.bring_up().await?;
        self.initialised = true;
        log::debug!("sx1262: ready");
        Ok(())
    }

    async fn deinit(&mut self) -> Result<(), RadioError> {
        self.initialised = false;
        self.set_standby().await?;
        self.write_command(cmd::SET_SLEEP, &[SLEEP_WARM_START]).await?;
        log::debug!("sx1262: sleeping");
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, RadioError> {
        if !self.initialised {
            return Err(RadioError::NotInitialised);
        }
        if data.len() > MAX_LORA_PAYLOAD {
            return Err(RadioError::Oversize);
        }
        if data.is_empty() {
            return Err(RadioError::InvalidConfig);
        }
        self.transmit(data).await?;
        Ok(data.len())
    }

    async fn recv(&mut self, timeout_ms: u32) -> Result<RxPacket, RadioError> {
        if !self.initialised {
            return Err(RadioError::NotInitialised);
        }
        Ok(self.receive(timeout_ms).await?)
    }

    async fn channel_clear(&mut self) -> ChannelState {
        if !self.initialised {
            return ChannelState::Error;
        }
        match self.run_cad().await {
            Ok(false) => ChannelState::Free,
            Ok(true) => ChannelState::Busy,
            Err(e) => {
                log::warn!("sx1262: cad failed: {:?}", e);
                ChannelState::Error
            }
        }
    }

    async fn rssi(&mut self) -> i16 {
        if !self.initialised {
            return i16::MIN;
        }
        self.instant_rssi().await.unwrap_or(i16::MIN)
    }
}
