#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::f64::consts::PI;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use recognition::{
    AuditEvent, AuditSink, CaptureError, Conversation, Deadline, ExtractError, FeatureExtractor,
    FeatureSet, FingerprintSample, IdentitySource, LoadedTemplates, Minutia, MinutiaKind,
    SampleSource, StoreError, Template, TemplateStore,
};

/// Deterministic, well-separated minutiae on an 8-column grid.
pub fn scattered(count: usize, seed: u32) -> FeatureSet {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        f64::from(state >> 8) / f64::from(1u32 << 24)
    };
    let minutiae = (0..count)
        .map(|i| {
            let (col, row) = ((i % 8) as f64, (i / 8) as f64);
            Minutia::new(
                col * 32.0 + next() * 6.0,
                row * 32.0 + next() * 6.0,
                next() * PI,
                if i % 4 == 0 {
                    MinutiaKind::Bifurcation
                } else {
                    MinutiaKind::Ending
                },
                1.0,
            )
        })
        .collect();
    FeatureSet::from_points(minutiae, 0.0, 1.0)
}

/// The first `count` points of `set`, optionally with far-away noise
/// points that cannot correspond to anything.
pub fn subset(set: &FeatureSet, count: usize, noise: usize) -> FeatureSet {
    let mut points: Vec<Minutia> = set.minutiae().iter().take(count).copied().collect();
    for i in 0..noise {
        points.push(Minutia::new(
            600.0 + 40.0 * i as f64,
            -500.0,
            0.3 * i as f64,
            MinutiaKind::Ending,
            1.0,
        ));
    }
    FeatureSet::from_points(points, set.orientation(), set.quality())
}

pub struct StubIdentity(pub Option<&'static str>);

impl IdentitySource for StubIdentity {
    fn user(&self) -> Option<String> {
        self.0.map(str::to_owned)
    }

    fn service(&self) -> Option<String> {
        Some("login".into())
    }
}

#[derive(Clone, Copy)]
pub enum CaptureBehaviour {
    Blank,
    Noise,
    Slow(Duration),
    NoSensor,
}

pub struct StubCapture {
    pub behaviour: CaptureBehaviour,
    pub calls: usize,
}

impl StubCapture {
    pub fn new(behaviour: CaptureBehaviour) -> Self {
        Self { behaviour, calls: 0 }
    }
}

impl SampleSource for StubCapture {
    fn capture(&mut self, _deadline: &Deadline) -> Result<FingerprintSample, CaptureError> {
        self.calls += 1;
        match self.behaviour {
            CaptureBehaviour::Blank => FingerprintSample::new(16, 16, vec![255; 256], 500),
            CaptureBehaviour::Noise => {
                let mut state: u32 = 0x9e37_79b9;
                let pixels = (0..160 * 160)
                    .map(|_| {
                        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        (state >> 24) as u8
                    })
                    .collect();
                FingerprintSample::new(160, 160, pixels, 500)
            }
            CaptureBehaviour::Slow(delay) => {
                thread::sleep(delay);
                FingerprintSample::new(16, 16, vec![255; 256], 500)
            }
            CaptureBehaviour::NoSensor => Err(CaptureError::Unavailable("unplugged".into())),
        }
    }
}

/// Extractor that hands back a prepared result regardless of the sample.
pub struct StubExtractor {
    result: Option<Result<FeatureSet, ExtractError>>,
    pub calls: Cell<usize>,
}

impl StubExtractor {
    pub fn returning(features: FeatureSet) -> Self {
        Self {
            result: Some(Ok(features)),
            calls: Cell::new(0),
        }
    }

    pub fn failing(err: ExtractError) -> Self {
        Self {
            result: Some(Err(err)),
            calls: Cell::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            result: None,
            calls: Cell::new(0),
        }
    }
}

impl FeatureExtractor for StubExtractor {
    fn extract(
        &self,
        _sample: &FingerprintSample,
        _deadline: &Deadline,
    ) -> Result<FeatureSet, ExtractError> {
        self.calls.set(self.calls.get() + 1);
        match &self.result {
            Some(result) => result.clone(),
            None => panic!("extractor blew up"),
        }
    }
}

pub struct MemoryStore(pub Vec<Template>);

impl TemplateStore for MemoryStore {
    fn load_templates(
        &self,
        identity: &str,
        _deadline: &Deadline,
    ) -> Result<LoadedTemplates, StoreError> {
        if self.0.is_empty() {
            return Err(StoreError::NotEnrolled(identity.to_owned()));
        }
        Ok(LoadedTemplates {
            templates: self.0.clone(),
            skipped: 0,
        })
    }
}

pub struct BrokenStore;

impl TemplateStore for BrokenStore {
    fn load_templates(
        &self,
        _identity: &str,
        _deadline: &Deadline,
    ) -> Result<LoadedTemplates, StoreError> {
        Err(StoreError::Unavailable {
            path: PathBuf::from("/var/lib/pam-fingerprint/users"),
            source: io::Error::new(io::ErrorKind::Other, "disk on fire"),
        })
    }
}

#[derive(Default)]
pub struct RecordingAudit(pub RefCell<Vec<AuditEvent>>);

impl AuditSink for RecordingAudit {
    fn record(&self, event: &AuditEvent) {
        self.0.borrow_mut().push(event.clone());
    }
}

#[derive(Default)]
pub struct RecordingConversation(pub RefCell<Vec<String>>);

impl Conversation for RecordingConversation {
    fn info(&self, message: &str) {
        self.0.borrow_mut().push(message.to_owned());
    }

    fn error(&self, message: &str) {
        self.0.borrow_mut().push(format!("error: {message}"));
    }
}
