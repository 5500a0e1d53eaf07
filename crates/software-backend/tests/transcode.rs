use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, CodecFactory, ContainerFormat, MediaFormat, OutputEvent, SurfaceTexture,
    VideoFrame, MIME_RAW_VIDEO,
};
use duocam_software::{read_clip, write_clip, SoftwareCodecFactory};

const T: Duration = Duration::from_millis(1);

/// Decode every picture of `path` through the factory's extractor and decoder.
fn decode_all(codecs: &SoftwareCodecFactory, path: &std::path::Path) -> Vec<VideoFrame> {
    let mut extractor = codecs.create_extractor(path).unwrap();
    let format = extractor.track_format(0).unwrap();
    extractor.select_track(0).unwrap();

    let texture = SurfaceTexture::new();
    let mut decoder = codecs.create_decoder(&format.mime).unwrap();
    decoder.configure(&format, texture.clone()).unwrap();
    decoder.start().unwrap();

    let mut pictures = Vec::new();
    let mut input_done = false;
    loop {
        if !input_done {
            if let Some(index) = decoder.dequeue_input_buffer(T).unwrap() {
                let buf = decoder.input_buffer(index).unwrap();
                match extractor.read_sample_data(buf).unwrap() {
                    Some(size) => {
                        let pts = extractor.sample_time_us().unwrap();
                        decoder
                            .queue_input_buffer(index, size, pts, BufferFlags::NONE)
                            .unwrap();
                        extractor.advance();
                    }
                    None => {
                        decoder
                            .queue_input_buffer(index, 0, 0, BufferFlags::END_OF_STREAM)
                            .unwrap();
                        input_done = true;
                    }
                }
            }
        }
        match decoder.dequeue_output_buffer(T).unwrap() {
            OutputEvent::Buffer { index, info } => {
                decoder.release_output_buffer(index, info.size > 0).unwrap();
                pictures.extend(texture.take_latest());
                if info.is_end_of_stream() {
                    break;
                }
            }
            OutputEvent::FormatChanged | OutputEvent::TryAgainLater => {}
        }
    }
    decoder.stop().unwrap();
    decoder.release();
    extractor.release();
    pictures
}

#[test]
fn decode_then_encode_preserves_pictures() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.y4m");
    let colors = [[200, 40, 40, 255], [40, 200, 40, 255], [40, 40, 200, 255]];
    write_clip(
        &source,
        8,
        8,
        30,
        colors.iter().map(|&c| VideoFrame::filled(8, 8, 0, c)),
    )
    .unwrap();

    let codecs = SoftwareCodecFactory::new();
    let pictures = decode_all(&codecs, &source);
    assert_eq!(pictures.len(), 3);
    assert_eq!(pictures[1].pts_us, 33_333);

    let output = dir.path().join("copy.y4m");
    let mut encoder = codecs.create_encoder(MIME_RAW_VIDEO).unwrap();
    encoder
        .configure(&MediaFormat::video(MIME_RAW_VIDEO, 8, 8).with_frame_rate(30.0))
        .unwrap();
    let surface = encoder.create_input_surface().unwrap();
    encoder.start().unwrap();
    let mut muxer = codecs
        .create_muxer(&output, ContainerFormat::from_path(&output))
        .unwrap();

    for picture in pictures {
        surface.queue_frame(picture).unwrap();
    }
    encoder.signal_end_of_input_stream().unwrap();

    let mut track = None;
    loop {
        match encoder.dequeue_output_buffer(T).unwrap() {
            OutputEvent::FormatChanged => {
                track = Some(muxer.add_track(&encoder.output_format().unwrap()).unwrap());
                muxer.start().unwrap();
            }
            OutputEvent::Buffer { index, info } => {
                if info.size > 0 {
                    let data = encoder.output_buffer(index).unwrap();
                    muxer.write_sample_data(track.unwrap(), data, &info).unwrap();
                }
                encoder.release_output_buffer(index).unwrap();
                if info.is_end_of_stream() {
                    break;
                }
            }
            OutputEvent::TryAgainLater => {}
        }
    }
    encoder.stop().unwrap();
    encoder.release();
    muxer.stop().unwrap();
    muxer.release();
    assert_eq!(codecs.resources().total(), 0);

    let (_, frames) = read_clip(&output).unwrap();
    assert_eq!(frames.len(), 3);
    for (frame, expected) in frames.iter().zip(colors) {
        let got = frame.pixel(4, 4);
        for channel in 0..3 {
            let diff = (got[channel] as i32 - expected[channel] as i32).abs();
            assert!(diff <= 6, "channel {channel}: {got:?} vs {expected:?}");
        }
    }
}
