use dccwave_core::driver::control_block::DmaControlBlock;
use dccwave_core::driver::QueuedBitstream;
use dccwave_core::hardware::{
    GPIO_OFFSET, GPIO_OUTPUT_SET_OFFSET, PERIPHERAL_BUS_BASE, PWM_CHANNEL_1_RANGE_OFFSET,
    PWM_FIFO_OFFSET, PWM_OFFSET,
};
use itertools::Itertools;
use tabled::Tabled;

/// One row of the control-block dump.
pub struct BlockRow {
    pub index: usize,
    pub kind: String,
    pub block: DmaControlBlock,
}

impl Tabled for BlockRow {
    const LENGTH: usize = 8;

    fn fields(&self) -> Vec<String> {
        let block = &self.block;
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.push(format!("{}", self.index));
        out.push(self.kind.clone());
        out.push(format!("{:#010X}", block.transfer_information.bits()));
        out.push(format!("{:#010X}", block.source_address));
        out.push(format!("{:#010X}", block.destination_address));
        if block.y_length() > 1 {
            out.push(format!("{}×{}", block.x_length(), block.y_length()));
        } else {
            out.push(format!("{}", block.x_length()));
        }
        out.push(format!(
            "{}/{}",
            block.source_stride(),
            block.destination_stride()
        ));
        out.push(format!("{:#010X}", block.next_control_block_address));
        out
    }

    fn headers() -> Vec<String> {
        ["#", "Kind", "Information", "Source", "Destination", "Length", "Stride", "Next"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Human name for what a block writes, resolved against the program's data.
pub fn classify_block(queued: &QueuedBitstream, block: &DmaControlBlock) -> String {
    let destination = block.destination_address;
    if destination == PERIPHERAL_BUS_BASE + PWM_OFFSET + PWM_FIFO_OFFSET {
        return format!("Data ({} words)", block.x_length() / 4);
    }
    if destination == PERIPHERAL_BUS_BASE + PWM_OFFSET + PWM_CHANNEL_1_RANGE_OFFSET {
        let range = queued.data()[(block.source_address / 4) as usize];
        return format!("Range ({range})");
    }
    if destination == PERIPHERAL_BUS_BASE + GPIO_OFFSET + GPIO_OUTPUT_SET_OFFSET {
        return "GPIO".to_string();
    }
    if destination < PERIPHERAL_BUS_BASE {
        let value = queued.data()[(block.source_address / 4) as usize] as i32;
        return if value < 0 { "End".to_string() } else { "Start".to_string() };
    }
    "?".to_string()
}

/// Packet bytes as spaced hex.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:#04X}")).join(" ")
}
