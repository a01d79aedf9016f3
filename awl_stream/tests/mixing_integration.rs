//! Mixing pipeline tests: two input pipelines averaged into one output.

use std::cell::RefCell;
use std::rc::Rc;

use awl_stream::audio_core::{AudioCore, AudioCoreCfg, CoreHal, PipelineId};
use awl_stream::endpoint::dummy::DummyEndpoint;
use awl_stream::endpoint::{Endpoint, EndpointCfg, EndpointOps};
use awl_stream::mixer::MixerCfg;
use awl_stream::pipeline::{MixerOption, PipelineCfg};
use awl_stream::{BitDepth, Error};

const PAYLOAD: u16 = 96;

type Capture = Rc<RefCell<Vec<Vec<u8>>>>;

struct ConstantProducer {
    value: u8,
}

impl EndpointOps for ConstantProducer {
    fn produce(&mut self, buffer: &mut [u8]) -> usize {
        buffer.fill(self.value);
        buffer.len()
    }
}

struct CaptureConsumer {
    captured: Capture,
}

impl EndpointOps for CaptureConsumer {
    fn consume(&mut self, buffer: &[u8]) -> usize {
        self.captured.borrow_mut().push(buffer.to_vec());
        buffer.len()
    }
}

fn ep_cfg(queue_size: u8) -> EndpointCfg {
    EndpointCfg {
        use_encapsulation: false,
        delayed_action: false,
        channel_count: 1,
        audio_payload_size: PAYLOAD,
        queue_size,
    }
}

fn input_pipeline(core: &mut AudioCore, name: &'static str, value: u8) -> PipelineId {
    let producer = Endpoint::new(
        name,
        Box::new(ConstantProducer { value }),
        ep_cfg(3),
    )
    .unwrap();
    let consumer = Endpoint::new("Mixer Feed EP", Box::new(DummyEndpoint), ep_cfg(4)).unwrap();
    let cfg = PipelineCfg {
        do_initial_buffering: false,
        mixer_option: MixerOption {
            input_mixer_pipeline: true,
            output_mixer_pipeline: false,
        },
    };
    core.pipeline_init(name, producer, cfg, consumer).unwrap()
}

fn setup_mixing_core(captured: &Capture) -> (AudioCore, PipelineId, PipelineId, PipelineId) {
    let mut core = AudioCore::new(
        AudioCoreCfg {
            memory_pool_size: 64 * 1024,
        },
        CoreHal::noop(),
    );
    core.mixer_init(MixerCfg {
        nb_of_inputs: 2,
        payload_size: PAYLOAD,
        bit_depth: BitDepth::Bits16,
    })
    .unwrap();

    // Constant 0x0B0B and 0x1515 i16 patterns average to 0x1010.
    let input_a = input_pipeline(&mut core, "Mix In A", 0x0B);
    let input_b = input_pipeline(&mut core, "Mix In B", 0x15);

    let producer = Endpoint::new("Mixer EP", Box::new(DummyEndpoint), ep_cfg(1)).unwrap();
    let consumer = Endpoint::new(
        "Mix Out EP",
        Box::new(CaptureConsumer {
            captured: Rc::clone(captured),
        }),
        ep_cfg(4),
    )
    .unwrap();
    let cfg = PipelineCfg {
        do_initial_buffering: false,
        mixer_option: MixerOption {
            input_mixer_pipeline: false,
            output_mixer_pipeline: true,
        },
    };
    let output = core
        .pipeline_init("Mix Out", producer, cfg, consumer)
        .unwrap();
    core.add_input_pipeline(output, input_a).unwrap();
    core.add_input_pipeline(output, input_b).unwrap();

    core.pipeline_setup(input_a).unwrap();
    core.pipeline_setup(input_b).unwrap();
    core.pipeline_setup(output).unwrap();
    core.pipeline_start(input_a);
    core.pipeline_start(input_b);
    core.pipeline_start(output);

    (core, input_a, input_b, output)
}

#[test]
fn test_two_streams_average() {
    let captured: Capture = Rc::new(RefCell::new(Vec::new()));
    let (mut core, input_a, input_b, output) = setup_mixing_core(&captured);

    for _ in 0..3 {
        core.pipeline_produce(input_a).unwrap();
        core.pipeline_process(input_a).unwrap();
        core.pipeline_produce(input_b).unwrap();
        core.pipeline_process(input_b).unwrap();

        core.pipeline_process(output).unwrap();
        core.pipeline_consume(output).unwrap();
    }

    let packets = captured.borrow();
    assert_eq!(packets.len(), 3);
    for packet in packets.iter() {
        assert_eq!(packet.len(), usize::from(PAYLOAD));
        assert!(packet.iter().all(|&b| b == 0x10), "not averaged: {packet:?}");
    }
}

#[test]
fn test_input_underrun_fills_silence() {
    let captured: Capture = Rc::new(RefCell::new(Vec::new()));
    let (mut core, input_a, _input_b, output) = setup_mixing_core(&captured);

    // Only input A delivers; input B underruns and mixes as silence.
    core.pipeline_produce(input_a).unwrap();
    core.pipeline_process(input_a).unwrap();
    core.pipeline_process(output).unwrap();
    core.pipeline_consume(output).unwrap();

    let packets = captured.borrow();
    assert_eq!(packets.len(), 1);
    // 0x0B0B averaged with silence halves to 0x0585 (rounding toward
    // zero per sample).
    let first = i16::from_le_bytes([packets[0][0], packets[0][1]]);
    assert_eq!(first, 0x0B0B / 2);
}

#[test]
fn test_silence_fill_advances_drift_accounting() {
    let captured: Capture = Rc::new(RefCell::new(Vec::new()));
    let (mut core, input_a, input_b, output) = setup_mixing_core(&captured);

    core.pipeline_produce(input_a).unwrap();
    core.pipeline_process(input_a).unwrap();
    let buffered_before = core.pipeline(input_b).samples_buffered_size();

    core.pipeline_process(output).unwrap();

    // Input B contributed only synthetic silence, recorded in its
    // advisory byte counter.
    let buffered_after = core.pipeline(input_b).samples_buffered_size();
    assert_eq!(buffered_after, buffered_before + u32::from(PAYLOAD));
}

#[test]
fn test_both_mixer_options_rejected() {
    let mut core = AudioCore::new(
        AudioCoreCfg {
            memory_pool_size: 8 * 1024,
        },
        CoreHal::noop(),
    );
    let producer = Endpoint::new("EP", Box::new(DummyEndpoint), ep_cfg(2)).unwrap();
    let consumer = Endpoint::new("EP", Box::new(DummyEndpoint), ep_cfg(2)).unwrap();
    let cfg = PipelineCfg {
        do_initial_buffering: false,
        mixer_option: MixerOption {
            input_mixer_pipeline: true,
            output_mixer_pipeline: true,
        },
    };
    assert!(matches!(
        core.pipeline_init("Bad", producer, cfg, consumer),
        Err(Error::MixerOption)
    ));
}

#[test]
fn test_mixing_without_mixer_rejected_at_setup() {
    let mut core = AudioCore::new(
        AudioCoreCfg {
            memory_pool_size: 8 * 1024,
        },
        CoreHal::noop(),
    );
    let producer = Endpoint::new("EP", Box::new(DummyEndpoint), ep_cfg(2)).unwrap();
    let consumer = Endpoint::new("EP", Box::new(DummyEndpoint), ep_cfg(2)).unwrap();
    let cfg = PipelineCfg {
        do_initial_buffering: false,
        mixer_option: MixerOption {
            input_mixer_pipeline: false,
            output_mixer_pipeline: true,
        },
    };
    let id = core.pipeline_init("Mix Out", producer, cfg, consumer).unwrap();
    assert!(matches!(
        core.pipeline_setup(id),
        Err(Error::MixerInitFailure)
    ));
}
