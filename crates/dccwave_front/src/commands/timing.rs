use dccwave_core::driver::DriverOptions;
use dccwave_core::timing::SignalTiming;

#[derive(clap::Args, Debug)]
pub struct TimingCommand {
    /// Pulse width to derive for, overriding the configured one
    #[clap(long)]
    pulse_width: Option<f32>,
}

pub fn handle_timing(command: TimingCommand, options: &DriverOptions) -> anyhow::Result<()> {
    let pulse_width = command.pulse_width.unwrap_or(options.pulse_width);
    let timing = SignalTiming::new(pulse_width)?;

    let rows = [
        ("one bit half", timing.one_bit_length()),
        ("zero bit half", timing.zero_bit_length()),
        ("cutout delay", timing.railcom_delay_length()),
        ("cutout", timing.railcom_length()),
    ];

    println!("pulse width {pulse_width}µs");
    for (element, pulses) in rows {
        println!(
            "{element:>14}: {pulses:3} pulses = {:7.1}µs",
            pulses as f32 * pulse_width
        );
    }
    println!(
        "{:>14}: {:3} one bits consumed",
        "cutout bits",
        timing.railcom_count()
    );

    Ok(())
}
