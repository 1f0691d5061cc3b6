mod live_channels;
