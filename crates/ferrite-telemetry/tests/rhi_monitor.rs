// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use ferrite_core::rhi::{QueueType, RhiSettings, SamplerDesc};
use ferrite_core::telemetry::{MetricId, ResourceMonitor};
use ferrite_infra::{NullDevice, NullDeviceConfig, UploadMemoryMonitor};
use ferrite_rhi::RhiDevice;
use ferrite_telemetry::{RhiMonitor, TelemetryService};
use std::sync::Arc;
use std::time::Duration;

fn gauge(service: &TelemetryService, id: MetricId) -> Result<f64> {
    let metric = service.metrics_registry().metric(&id)?;
    metric
        .value
        .as_gauge()
        .ok_or_else(|| anyhow::anyhow!("{id} is not a gauge"))
}

#[test]
fn device_statistics_flow_into_gauges() -> Result<()> {
    ferrite_telemetry::logging::init();
    let native = NullDevice::new(NullDeviceConfig::manual())?;
    let device = RhiDevice::new(native.clone(), RhiSettings::default())?;

    let mut service = TelemetryService::new(Duration::ZERO);
    let rhi_monitor = Arc::new(RhiMonitor::new(service.metrics_registry())?);
    service.monitor_registry().register(rhi_monitor.clone());
    service
        .monitor_registry()
        .register(Arc::new(UploadMemoryMonitor::new(&native, "null_upload")));

    let _samplers = (0..3)
        .map(|_| device.create_sampler(SamplerDesc::default()))
        .collect::<Result<Vec<_>, _>>()?;
    {
        let mut context = device.create_context(QueueType::Direct);
        context.upload_to_resource(ferrite_core::rhi::ResourceId(1), 0, &[7u8; 64])?;
        context.draw(3, 1)?;
        context.flush()?;
    }
    device.begin_frame()?;

    rhi_monitor.record(&device.stats())?;
    assert!(service.tick());

    let direct = MetricId::new("rhi", "allocators_created").with_label("queue", "direct");
    assert_eq!(gauge(&service, direct)?, 1.0);
    // Three samplers plus the null sampler.
    let samplers =
        MetricId::new("rhi", "offline_descriptors_in_use").with_label("kind", "sampler");
    assert_eq!(gauge(&service, samplers)?, 4.0);
    assert_eq!(gauge(&service, MetricId::new("rhi", "upload_pages_created"))?, 1.0);
    assert_eq!(gauge(&service, MetricId::new("rhi", "device_lost"))?, 0.0);

    let upload = service
        .monitor_registry()
        .monitors()
        .into_iter()
        .find(|monitor| monitor.monitor_id() == "null_upload")
        .ok_or_else(|| anyhow::anyhow!("upload monitor missing"))?;
    assert_eq!(
        upload.usage_report().current,
        device.settings().upload_page_size
    );
    assert!(rhi_monitor.usage_report().current >= 4);
    Ok(())
}
