mod playout_selftest;
