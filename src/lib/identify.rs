use log::{debug, info};
use std::fmt::Display;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::framer::{FrameFormat, Framer};
use crate::gio::{self, Endpoint, SerialParameters};
use crate::protocol::{Family, Identity, Model, Variant};

/// How a probe reacts to one received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Useful but not conclusive, keep listening.
    Continue,
    /// Not an answer to the probe, keep listening.
    Unexpected,
    /// The display answered with something this variant can't be.
    Fail,
    Done(Identity),
}

/// One identification handshake for one protocol variant.
pub trait Probe {
    fn variant(&self) -> Variant;

    fn format(&self) -> FrameFormat;

    fn attempts(&self) -> usize;

    /// How long to wait for the first reply.
    fn window(&self) -> Duration;

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()>;

    fn handle(&mut self, packet: &[u8]) -> Response;

    /// Called when an attempt ends without `Done`.
    fn exhausted(&mut self) -> Option<Identity> {
        None
    }
}

/// Runs `probe` with a different attempt count.
pub struct WithAttempts {
    probe: Box<dyn Probe>,
    attempts: usize,
}

impl WithAttempts {
    pub fn new(probe: Box<dyn Probe>, attempts: usize) -> Self {
        WithAttempts { probe, attempts }
    }
}

impl Probe for WithAttempts {
    fn variant(&self) -> Variant {
        self.probe.variant()
    }

    fn format(&self) -> FrameFormat {
        self.probe.format()
    }

    fn attempts(&self) -> usize {
        self.attempts
    }

    fn window(&self) -> Duration {
        self.probe.window()
    }

    fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
        self.probe.request(framer, endpoint)
    }

    fn handle(&mut self, packet: &[u8]) -> Response {
        self.probe.handle(packet)
    }

    fn exhausted(&mut self) -> Option<Identity> {
        self.probe.exhausted()
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub speed: u32,
    pub payload: Vec<u8>,
    pub model: Option<Model>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identified {
    /// Zero on links without a line speed.
    pub speed: u32,
    pub variant: Variant,
    pub identity: Identity,
}

impl Display for Identified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.identity.model.name, self.variant)?;
        if let Some((major, minor)) = self.identity.version {
            write!(f, " firmware {}.{}", major, minor)?;
        }
        if self.speed != 0 {
            write!(f, " @ {} baud", self.speed)?;
        }
        Ok(())
    }
}

const WINDOW_FLOOR: Duration = Duration::from_millis(100);

fn run_probe(endpoint: &mut Endpoint, probe: &mut dyn Probe, speed: u32) -> Option<Identity> {
    let mut framer = Framer::new(probe.format());
    let initial = probe.window();
    let floor = initial.min(WINDOW_FLOOR);
    let mut window = initial;

    for attempt in 1..=probe.attempts() {
        if let Err(e) = probe.request(&mut framer, endpoint) {
            debug!("{} probe not sent: {}", probe.variant(), e);
            return None;
        }

        loop {
            match endpoint.await_input(window) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    debug!("{} probe input failed: {}", probe.variant(), e);
                    return None;
                }
            }

            let payload = match framer.read_packet(endpoint, false) {
                Ok(Some(packet)) => packet,
                Ok(None) | Err(Error::Corrupt) => continue,
                Err(e) => {
                    debug!("{} probe input failed: {}", probe.variant(), e);
                    return None;
                }
            };

            let response = probe.handle(&payload);
            let result = ProbeResult {
                speed,
                payload,
                model: match response {
                    Response::Done(identity) => Some(identity.model),
                    _ => None,
                },
            };
            debug!("{} probe: {:?} -> {:?}", probe.variant(), result, response);

            match response {
                Response::Done(identity) => return Some(identity),
                Response::Fail => return None,
                Response::Continue | Response::Unexpected => {}
            }
        }

        if let Some(identity) = probe.exhausted() {
            return Some(identity);
        }
        debug!(
            "{} probe attempt {} at {} baud: no answer",
            probe.variant(),
            attempt,
            speed
        );
        window = (window / 2).max(floor);
    }

    None
}

/// Finds the speed and protocol variant a display answers to.
///
/// Speeds are tried in order and, at each one, every probe in order. A
/// link whose speed can't be set is probed once.
pub fn identify(endpoint: &mut Endpoint, speeds: &[u32], probes: &mut [Box<dyn Probe>]) -> Result<Identified> {
    for &speed in speeds {
        let fixed = match endpoint.reconfigure(&SerialParameters::with_baud(speed)) {
            Ok(()) => false,
            Err(e) if e.is_unsupported() => true,
            Err(e) => {
                debug!("cannot switch to {} baud: {}", speed, e);
                continue;
            }
        };
        let speed = if fixed { 0 } else { speed };

        for probe in probes.iter_mut() {
            if let Err(e) = endpoint.discard_input() {
                debug!("{} probe skipped at {} baud: {}", probe.variant(), speed, e);
                continue;
            }
            if let Some(identity) = run_probe(endpoint, probe.as_mut(), speed) {
                let identified = Identified {
                    speed,
                    variant: probe.variant(),
                    identity,
                };
                info!("identified {}", identified);
                return Ok(identified);
            }
        }

        if fixed {
            break;
        }
    }

    info!("identification exhausted: speeds {:?}", speeds);
    Err(Error::NotFound)
}

/// A display that answered the identification handshake.
pub struct Detected {
    pub endpoint: Endpoint,
    pub identified: Identified,
}

/// Overrides for the family's identification defaults.
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    pub speeds: Option<Vec<u32>>,
    pub attempts: Option<usize>,
}

/// Connects to `identifier` and identifies the `family` display behind it.
pub fn detect(identifier: &str, family: Family, options: &DetectOptions) -> Result<Detected> {
    let mut endpoint = gio::connect(identifier, &family.descriptor())?;
    let speeds = match &options.speeds {
        Some(speeds) => speeds.clone(),
        None => family.speeds(endpoint.kind()),
    };
    let mut probes = family.probes(endpoint.kind());
    if let Some(attempts) = options.attempts {
        probes = probes
            .into_iter()
            .map(|probe| Box::new(WithAttempts::new(probe, attempts)) as Box<dyn Probe>)
            .collect();
    }

    match identify(&mut endpoint, &speeds, &mut probes) {
        Ok(identified) => Ok(Detected {
            endpoint,
            identified,
        }),
        Err(e) => {
            endpoint.disconnect();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::LengthRule;
    use crate::gio::fake::{FakeDevice, FakeTransport};
    use crate::gio::Descriptor;
    use crate::protocol::find_model;
    use proptest::prelude::*;

    const MODELS: &[Model] = &[
        Model::new(0x07, "Test 20", 20, 0, 1),
        Model::new(0x2A, "Test 40", 40, 3, 1),
    ];

    // 7F 06 asks for identity, the display answers 7F 07 <model>
    struct TestProbe {
        attempts: usize,
    }

    impl Probe for TestProbe {
        fn variant(&self) -> Variant {
            Variant::Alva
        }

        fn format(&self) -> FrameFormat {
            FrameFormat::new(&[0x7F], LengthRule::Fixed(3))
        }

        fn attempts(&self) -> usize {
            self.attempts
        }

        fn window(&self) -> Duration {
            Duration::from_millis(1000)
        }

        fn request(&mut self, framer: &mut Framer, endpoint: &mut Endpoint) -> Result<()> {
            framer.write_packet(endpoint, &[0x7F, 0x06])?;
            Ok(())
        }

        fn handle(&mut self, packet: &[u8]) -> Response {
            if packet[1] != 0x07 {
                return Response::Unexpected;
            }
            match find_model(MODELS, packet[2]) {
                Some(model) => Response::Done(Identity::new(model)),
                None => Response::Fail,
            }
        }
    }

    fn device(baud: u32, model: u8) -> FakeDevice {
        FakeDevice::new(baud, move |request| {
            if request == [0x7F, 0x06] {
                Some(vec![0x7F, 0x07, model])
            } else {
                None
            }
        })
    }

    fn endpoint(device: FakeDevice) -> Endpoint {
        Endpoint::with_transport(Box::new(device), Descriptor::default().serial.options)
    }

    fn probes(attempts: usize) -> Vec<Box<dyn Probe>> {
        vec![Box::new(TestProbe { attempts })]
    }

    #[test]
    fn second_speed_answers() {
        let device = device(38400, 0x2A);
        let requests = device.requests();
        let mut endpoint = endpoint(device);

        let identified = identify(&mut endpoint, &[19200, 38400], &mut probes(2)).unwrap();
        assert_eq!(identified.speed, 38400);
        assert_eq!(identified.identity.model.name, "Test 40");
        assert_eq!(identified.variant, Variant::Alva);
        assert_eq!(endpoint.bytes_per_second(), 3840);

        let requests = requests.lock().unwrap();
        let bauds: Vec<u32> = requests.iter().map(|(baud, _)| *baud).collect();
        assert_eq!(bauds, vec![19200, 19200, 38400]);
    }

    #[test]
    fn silent_display_is_not_found() {
        let device = device(57600, 0x2A);
        let requests = device.requests();
        let mut endpoint = endpoint(device);

        assert!(matches!(
            identify(&mut endpoint, &[19200, 38400], &mut probes(3)),
            Err(Error::NotFound)
        ));
        assert_eq!(requests.lock().unwrap().len(), 6);
    }

    #[test]
    fn unknown_model_fails_the_probe() {
        let device = device(9600, 0x55);
        let requests = device.requests();
        let mut endpoint = endpoint(device);

        assert!(identify(&mut endpoint, &[9600], &mut probes(3)).is_err());
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn fixed_rate_link_is_probed_once() {
        let device = FakeDevice::fixed_rate(|_| Some(vec![0x7F, 0x07, 0x07]));
        let requests = device.requests();
        let mut endpoint = endpoint(device);

        let identified = identify(&mut endpoint, &[115200, 57600], &mut probes(2)).unwrap();
        assert_eq!(identified.speed, 0);
        assert_eq!(identified.identity.model.text_columns, 20);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn attempts_override() {
        let device = device(57600, 0x2A);
        let requests = device.requests();
        let mut endpoint = endpoint(device);

        let mut probes: Vec<Box<dyn Probe>> = vec![Box::new(WithAttempts::new(
            Box::new(TestProbe { attempts: 3 }),
            1,
        ))];
        assert!(identify(&mut endpoint, &[9600, 19200], &mut probes).is_err());
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn broken_line_is_not_found() {
        let fake = FakeTransport::new();
        fake.fail_next();
        let mut endpoint = fake.endpoint(Descriptor::default().serial.options);

        assert!(matches!(
            identify(&mut endpoint, &[9600, 19200], &mut probes(1)),
            Err(Error::NotFound)
        ));
        // the first speed is skipped, the second one is probed
        assert_eq!(fake.written(), vec![vec![0x7F, 0x06]]);
    }

    #[test]
    fn identified_display() {
        let identified = Identified {
            speed: 19200,
            variant: Variant::Papenmeier1,
            identity: Identity::with_version(MODELS[1], 1, 25),
        };
        assert_eq!(
            identified.to_string(),
            "Test 40 (Papenmeier protocol 1) firmware 1.25 @ 19200 baud"
        );
    }

    proptest! {
        #[test]
        fn answers_only_at_its_speed(
            speeds in Just(vec![9600u32, 19200, 38400, 57600, 115200]).prop_shuffle(),
            position in 0usize..5,
            attempts in 1usize..4,
        ) {
            let baud = speeds[position];
            let device = device(baud, 0x07);
            let requests = device.requests();
            let mut endpoint = endpoint(device);

            let identified = identify(&mut endpoint, &speeds, &mut probes(attempts)).unwrap();
            prop_assert_eq!(identified.speed, baud);
            prop_assert_eq!(identified.identity.model.identifier, 0x07);
            prop_assert!(requests.lock().unwrap().len() <= attempts * (position + 1));
        }
    }
}
