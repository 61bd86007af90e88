use ipe::backends::memory::{
    LinearStriping, MemoryBufferManager, MemoryPropertyStore, RecordingDriver,
};
use ipe::backends::{BufferManager, PropertyKey, PropertyStore, PropertyValue};
use ipe::{
    BufferRequirement, ChipVersion, Dimension, Event, Format, InstanceProperty, OutputPort,
    Outcome, PortRequirement, PortSlot, ProcessRequest, StabilizationType,
};
use std::sync::Arc;

fn main() {
    env_logger::init();

    let driver = Arc::new(RecordingDriver::new());
    let store = Arc::new(MemoryPropertyStore::new());
    let buffers = Arc::new(MemoryBufferManager::new());
    let debug = ipe::DebugDataService::create();

    let props = InstanceProperty::new()
        .stabilization(StabilizationType::MCTF)
        .num_passes(2);
    let mut node = ipe::Builder::new()
        .props(props)
        .chip(ChipVersion::Titan480)
        .depth(4)
        .port(PortRequirement {
            port: OutputPort::Display,
            format: Format::UbwcNv12,
            consumers: vec![BufferRequirement::new(Dimension::new(1920, 1080))],
        })
        .port(PortRequirement {
            port: OutputPort::Video,
            format: Format::Nv12,
            consumers: vec![BufferRequirement::new(Dimension::new(1280, 720))],
        })
        .driver(driver.clone())
        .store(store.clone())
        .buffers(buffers.clone())
        .striping(Arc::new(LinearStriping::new()))
        .debug(debug.clone())
        .build()
        .unwrap();

    node.acquire().unwrap();
    println!("input {}", node.negotiated().unwrap().input.optimal);

    let image_desc = ipe::backends::Description::new()
        .format(Format::UbwcTp10)
        .extent(ipe::backends::Extent::image(Dimension::new(1920, 1080)));

    for rid in 1..=6 {
        let images = buffers.allocate(&image_desc, 2).unwrap();
        let req = ProcessRequest::new(rid)
            .image(0, PortSlot::Input, images[0])
            .image(0, PortSlot::Display, images[1]);

        loop {
            match node.execute_process_request(&req).unwrap() {
                Outcome::Submitted(fence) => {
                    println!("request {} -> {:?}", rid, fence);
                    node.handle_event(Event::FenceSignaled(fence));
                    break;
                }
                Outcome::NotReady(deps) => {
                    println!("request {} waits for {:?}", rid, deps);
                    for dep in deps {
                        let value = match dep.key {
                            PropertyKey::AecGain => PropertyValue::Gain(1.0 + rid as f32 / 10.0),
                            _ => PropertyValue::Blob(vec![0; 64]),
                        };
                        store.publish(dep.key, rid - dep.offset, value).unwrap();
                    }
                }
            }
        }

        for image in images {
            buffers.release(image.handle);
        }
    }

    for sub in driver.submissions() {
        println!(
            "request {}: {} patches, {} bytes of frame process, {} bytes of blob",
            sub.request_id,
            sub.patches.len(),
            sub.frame_process.len(),
            sub.blob.len()
        );
    }
    if let Some(writer) = debug.writer() {
        println!("{} debug records", writer.records().len());
    }

    node.release();
}
